//! Model graph construction and traversal
//!
//! Rules enforced when building:
//! 1. Unit identifiers are unique.
//! 2. Every upstream reference (and every assertion's owner and relationship
//!    target) names a declared unit.
//! 3. The graph is acyclic.
//!
//! Ordering is Kahn's algorithm with the ready set keyed by declaration
//! index, so units with no constraint between them keep declaration order.

use modelrun_core::{Assertion, AssertionKind, Unit, UnitId, UnitKind};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Graph-build errors; fatal before any execution starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Ordered cycle, first unit repeated at the end
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<UnitId> },

    #[error("duplicate unit '{0}'")]
    DuplicateUnit(UnitId),

    #[error("unit '{unit}' references unknown unit '{reference}'")]
    UnknownReference { unit: UnitId, reference: UnitId },

    /// Assertion bound to a unit that is not declared
    #[error("assertion '{assertion}' is bound to unknown unit '{unit}'")]
    UnknownAssertionUnit { assertion: String, unit: UnitId },
}

/// Validated, immutable DAG of units plus their assertions
#[derive(Debug, Clone)]
pub struct ModelGraph {
    /// Units in declaration order
    units: Vec<Unit>,

    /// Unit identifier -> declaration index
    index: HashMap<UnitId, usize>,

    /// Declaration index -> upstream indices
    parents: Vec<Vec<usize>>,

    /// Declaration index -> downstream indices, ascending
    children: Vec<Vec<usize>>,

    /// Topological order (declaration indices)
    order: Vec<usize>,

    /// Assertions in declaration order
    assertions: Vec<Assertion>,
}

impl ModelGraph {
    /// Validate units and assertions and build the graph
    pub fn build(units: Vec<Unit>, assertions: Vec<Assertion>) -> Result<Self, GraphError> {
        let mut index: HashMap<UnitId, usize> = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateUnit(unit.name.clone()));
            }
        }

        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); units.len()];

        for (i, unit) in units.iter().enumerate() {
            for reference in &unit.upstream {
                let parent = *index.get(reference).ok_or_else(|| GraphError::UnknownReference {
                    unit: unit.name.clone(),
                    reference: reference.clone(),
                })?;

                if !parents[i].contains(&parent) {
                    parents[i].push(parent);
                    children[parent].push(i);
                }
            }
        }

        for assertion in &assertions {
            if !index.contains_key(&assertion.unit) {
                return Err(GraphError::UnknownAssertionUnit {
                    assertion: assertion.name.clone(),
                    unit: assertion.unit.clone(),
                });
            }
            if let AssertionKind::Relationship { to, .. } = &assertion.kind {
                if !index.contains_key(to) {
                    return Err(GraphError::UnknownReference {
                        unit: assertion.unit.clone(),
                        reference: to.clone(),
                    });
                }
            }
        }

        for list in &mut children {
            list.sort_unstable();
        }

        let order = topological_order(&parents, &children)
            .map_err(|remaining| GraphError::Cycle {
                path: find_cycle(&parents, &remaining)
                    .into_iter()
                    .map(|i| units[i].name.clone())
                    .collect(),
            })?;

        Ok(Self {
            units,
            index,
            parents,
            children,
            order,
            assertions,
        })
    }

    /// Build a graph from `(unit, upstreams)` pairs, in declaration order
    ///
    /// Every unit is a mart with an empty body; useful when only the shape
    /// of the graph matters.
    pub fn from_dependencies<I, S, D>(dependencies: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<UnitId>,
        D: IntoIterator,
        D::Item: Into<UnitId>,
    {
        let units = dependencies
            .into_iter()
            .map(|(name, upstream)| Unit::new(name, UnitKind::Mart, "").with_upstream(upstream))
            .collect();
        Self::build(units, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units in declaration order
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.index.get(name).map(|&i| &self.units[i])
    }

    /// Declaration index of a unit
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Unit at a declaration index
    pub fn unit_at(&self, index: usize) -> &Unit {
        &self.units[index]
    }

    /// Upstream declaration indices of the unit at `index`
    pub fn parent_indices(&self, index: usize) -> &[usize] {
        &self.parents[index]
    }

    /// Downstream declaration indices of the unit at `index`, ascending
    pub fn child_indices(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Immediate upstreams of a unit
    pub fn parents(&self, name: &str) -> Vec<&UnitId> {
        self.index
            .get(name)
            .map(|&i| self.parents[i].iter().map(|&p| &self.units[p].name).collect())
            .unwrap_or_default()
    }

    /// Immediate dependents of a unit
    pub fn children(&self, name: &str) -> Vec<&UnitId> {
        self.index
            .get(name)
            .map(|&i| self.children[i].iter().map(|&c| &self.units[c].name).collect())
            .unwrap_or_default()
    }

    /// All downstream units (transitive closure of children), in run order
    ///
    /// This is the "blast radius" - everything skipped if this unit fails.
    pub fn downstream(&self, name: &str) -> Vec<UnitId> {
        self.closure(name, &self.children)
    }

    /// All upstream units (transitive closure of parents), in run order
    pub fn upstream(&self, name: &str) -> Vec<UnitId> {
        self.closure(name, &self.parents)
    }

    /// Whether `ancestor` is a transitive upstream of `name`
    pub fn is_upstream_of(&self, ancestor: &str, name: &str) -> bool {
        self.upstream(name).iter().any(|id| id == ancestor)
    }

    /// Execution order: every unit after all of its upstreams
    pub fn topological_order(&self) -> Vec<&UnitId> {
        self.order.iter().map(|&i| &self.units[i].name).collect()
    }

    /// Execution order as declaration indices
    pub fn order_indices(&self) -> &[usize] {
        &self.order
    }

    /// All assertions in declaration order
    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    /// Assertions bound to one unit
    pub fn assertions_for(&self, name: &str) -> Vec<&Assertion> {
        self.assertions.iter().filter(|a| a.unit == name).collect()
    }

    /// SHA-256 over the graph's content, hex encoded
    ///
    /// Equal graphs always produce equal digests; any change to a unit body,
    /// dependency or assertion changes it.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();

        for unit in &self.units {
            hasher.update(unit.name.as_bytes());
            hasher.update([0]);
            hasher.update(unit.kind.as_str().as_bytes());
            hasher.update([0]);
            hasher.update(unit.upstream.join(",").as_bytes());
            hasher.update([0]);
            if let Some(materialization) = unit.effective_materialization() {
                hasher.update(materialization.to_string().as_bytes());
            }
            hasher.update([0]);
            if let Some(relation) = &unit.relation {
                hasher.update(relation.fqn().as_bytes());
            }
            hasher.update([0]);
            hasher.update(unit.body.as_bytes());
            hasher.update([1]);
        }

        for assertion in &self.assertions {
            if let Ok(json) = serde_json::to_string(assertion) {
                hasher.update(json.as_bytes());
            }
            hasher.update([1]);
        }

        hex::encode(hasher.finalize())
    }

    fn closure(&self, name: &str, edges: &[Vec<usize>]) -> Vec<UnitId> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut queue: VecDeque<usize> = edges[start].iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for &next in &edges[current] {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        self.order
            .iter()
            .filter(|i| visited.contains(i))
            .map(|&i| self.units[i].name.clone())
            .collect()
    }
}

/// Kahn's algorithm; the lowest ready declaration index goes first
///
/// On a cycle returns the indices that could not be ordered.
fn topological_order(parents: &[Vec<usize>], children: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..parents.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(parents.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);

        for &child in &children[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() == parents.len() {
        Ok(order)
    } else {
        Err((0..parents.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Recover one cycle from the nodes Kahn's algorithm could not order
///
/// Every leftover node still has a leftover parent, so walking parents from
/// any of them must revisit a node. The walk runs consumer -> producer; the
/// result is reversed into dependency-flow order and rotated to start at its
/// lowest declaration index.
fn find_cycle(parents: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let remaining_set: HashSet<usize> = remaining.iter().copied().collect();
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut walk = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = parents[current].iter().find(|p| remaining_set.contains(p)) else {
            return walk;
        };

        if let Some(&seen_at) = position.get(&next) {
            let mut cycle: Vec<usize> = walk[seen_at..].to_vec();
            cycle.reverse();

            let lowest = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, node)| **node)
                .map(|(i, _)| i)
                .unwrap_or(0);
            cycle.rotate_left(lowest);
            cycle.push(cycle[0]);
            return cycle;
        }

        position.insert(next, walk.len());
        walk.push(next);
        current = next;
    }
}
