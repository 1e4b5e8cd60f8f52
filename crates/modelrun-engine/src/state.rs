//! Per-unit run state
//!
//! The scheduler loop owns the only `RunState` of a run; worker tasks never
//! touch it. Every status change goes through `transition`, which rejects
//! moves the unit state machine does not allow.

use modelrun_core::{
    AssertionOutcome, Relation, RunReport, SkipReason, TransitionError, UnitResult, UnitStatus,
};
use modelrun_project::ModelGraph;
use std::collections::BTreeMap;

/// Why a unit was skipped, before blocked-by lists are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    UpstreamFailed,
    Cancelled,
}

/// Status map and captured output for every unit, by declaration index
#[derive(Debug)]
pub struct RunState<'g> {
    graph: &'g ModelGraph,
    statuses: Vec<UnitStatus>,
    relations: Vec<Option<Relation>>,
    errors: Vec<Option<String>>,
    warnings: Vec<Vec<String>>,
    skips: Vec<Option<SkipCause>>,
    assertions: Vec<Vec<AssertionOutcome>>,
}

impl<'g> RunState<'g> {
    /// Every unit pending
    pub fn new(graph: &'g ModelGraph) -> Self {
        let len = graph.len();
        Self {
            graph,
            statuses: vec![UnitStatus::Pending; len],
            relations: vec![None; len],
            errors: vec![None; len],
            warnings: vec![Vec::new(); len],
            skips: vec![None; len],
            assertions: vec![Vec::new(); len],
        }
    }

    pub fn status(&self, index: usize) -> UnitStatus {
        self.statuses[index]
    }

    /// Move a unit to `to`
    pub fn transition(&mut self, index: usize, to: UnitStatus) -> Result<(), TransitionError> {
        let from = self.statuses[index];
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                unit: self.graph.unit_at(index).name.clone(),
                from,
                to,
            });
        }
        self.statuses[index] = to;
        Ok(())
    }

    /// Pending and every direct upstream succeeded
    pub fn is_ready(&self, index: usize) -> bool {
        self.statuses[index] == UnitStatus::Pending
            && self
                .graph
                .parent_indices(index)
                .iter()
                .all(|&parent| self.statuses[parent] == UnitStatus::Succeeded)
    }

    /// Relation a succeeded unit resolved to
    pub fn relation(&self, index: usize) -> Option<&Relation> {
        self.relations[index].as_ref()
    }

    pub fn set_relation(&mut self, index: usize, relation: Relation) {
        self.relations[index] = Some(relation);
    }

    pub fn set_error(&mut self, index: usize, error: impl Into<String>) {
        self.errors[index] = Some(error.into());
    }

    pub fn add_warning(&mut self, index: usize, warning: impl Into<String>) {
        self.warnings[index].push(warning.into());
    }

    pub fn add_assertion(&mut self, index: usize, outcome: AssertionOutcome) {
        self.assertions[index].push(outcome);
    }

    /// Skip a pending unit
    pub fn skip(&mut self, index: usize, cause: SkipCause) -> Result<(), TransitionError> {
        self.transition(index, UnitStatus::Skipped)?;
        self.skips[index] = Some(cause);
        Ok(())
    }

    /// Skip every pending descendant of `index`; returns the skipped indices
    pub fn skip_descendants(&mut self, index: usize) -> Vec<usize> {
        let mut skipped = Vec::new();
        let mut stack = vec![index];

        while let Some(current) = stack.pop() {
            for &child in self.graph.child_indices(current) {
                if self.statuses[child] == UnitStatus::Pending {
                    self.statuses[child] = UnitStatus::Skipped;
                    self.skips[child] = Some(SkipCause::UpstreamFailed);
                    skipped.push(child);
                    stack.push(child);
                }
            }
        }

        skipped.sort_unstable();
        skipped
    }

    /// Indices still pending, ascending
    pub fn pending(&self) -> Vec<usize> {
        (0..self.statuses.len())
            .filter(|&i| self.statuses[i] == UnitStatus::Pending)
            .collect()
    }

    /// Direct upstreams that did not succeed, in declaration order
    pub fn blocked_by(&self, index: usize) -> Vec<String> {
        let mut parents: Vec<usize> = self
            .graph
            .parent_indices(index)
            .iter()
            .copied()
            .filter(|&parent| self.statuses[parent] != UnitStatus::Succeeded)
            .collect();
        parents.sort_unstable();
        parents
            .into_iter()
            .map(|parent| self.graph.unit_at(parent).name.clone())
            .collect()
    }

    /// Snapshot the final state into a report
    pub fn into_report(self, cancelled: bool) -> RunReport {
        let mut results = BTreeMap::new();

        for index in 0..self.statuses.len() {
            let status = self.statuses[index];
            let skip_reason = match self.skips[index] {
                Some(SkipCause::UpstreamFailed) => Some(SkipReason::UpstreamFailed {
                    blocked_by: self.blocked_by(index),
                }),
                Some(SkipCause::Cancelled) => Some(SkipReason::Cancelled),
                None => None,
            };

            let result = UnitResult {
                status,
                relation: self.relations[index].clone(),
                error: self.errors[index].clone(),
                warnings: self.warnings[index].clone(),
                skip_reason,
                assertions: self.assertions[index].clone(),
            };
            results.insert(self.graph.unit_at(index).name.clone(), result);
        }

        let order = self.graph.topological_order().into_iter().cloned().collect();
        RunReport::new(self.graph.digest(), order, results, cancelled)
    }
}
