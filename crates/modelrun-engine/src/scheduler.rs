//! Topological scheduler
//!
//! ## Algorithm
//!
//! 1. Units with no upstreams are ready. The ready set is keyed by position
//!    in the planned order, so the lowest-positioned ready unit starts first
//!    and `threads = 1` runs exactly the planned order.
//! 2. Loop:
//!    a. While fewer than `threads` workers are in flight and the run is not
//!       cancelled, start the next ready unit
//!    b. Wait for any worker to finish
//!    c. Apply its outcome: succeeded units release their children, failed
//!       units skip every pending descendant
//! 3. Pending units left after cancellation are skipped.
//! 4. Deferred relationship assertions run, in declaration order.
//!
//! The loop is the only writer of the run state; workers hand their results
//! back through the join set, keyed by task id so a panicking worker still
//! maps to its unit.

use modelrun_core::{AssertionKind, AssertionStatus, RunReport, UnitStatus};
use modelrun_project::ModelGraph;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::driver::{execute_unit, RunContext, UnitOutcome, UnitTask};
use crate::state::{RunState, SkipCause};
use crate::test_gate::is_deferred;

/// Drives one run of a graph
pub struct Scheduler<'g> {
    graph: &'g ModelGraph,
    context: Arc<RunContext>,
    threads: usize,

    /// Declaration index -> position in the planned order
    position: Vec<usize>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g ModelGraph, context: Arc<RunContext>, threads: usize) -> Self {
        let mut position = vec![0; graph.len()];
        for (pos, &index) in graph.order_indices().iter().enumerate() {
            position[index] = pos;
        }

        Self {
            graph,
            context,
            threads: threads.max(1),
            position,
        }
    }

    /// Execute every unit and return the final report
    ///
    /// Workers are owned by the join set, so dropping the returned future
    /// aborts every unit still in flight.
    pub async fn run(self, cancellation: CancellationToken) -> RunReport {
        let mut state = RunState::new(self.graph);
        let mut tasks: JoinSet<UnitOutcome> = JoinSet::new();
        let mut workers: HashMap<Id, usize> = HashMap::new();

        let mut ready: BTreeSet<usize> = (0..self.graph.len())
            .filter(|&index| state.is_ready(index))
            .map(|index| self.position[index])
            .collect();

        loop {
            while tasks.len() < self.threads && !cancellation.is_cancelled() {
                let Some(pos) = ready.pop_first() else {
                    break;
                };
                let index = self.graph.order_indices()[pos];
                if let Some(id) = self.start(&mut state, &mut tasks, index) {
                    workers.insert(id, index);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let outcome = match joined {
                Ok((id, outcome)) => {
                    workers.remove(&id);
                    outcome
                }
                Err(join_error) => {
                    let Some(index) = workers.remove(&join_error.id()) else {
                        tracing::error!(error = %join_error, "unknown worker task ended abnormally");
                        continue;
                    };
                    tracing::error!(
                        unit = %self.graph.unit_at(index).name,
                        error = %join_error,
                        "worker task ended abnormally"
                    );
                    let message = if join_error.is_panic() {
                        "unit task panicked"
                    } else {
                        "unit task was cancelled"
                    };
                    UnitOutcome::failed(index, message)
                }
            };

            for child in self.apply(&mut state, outcome) {
                ready.insert(self.position[child]);
            }
        }

        let cancelled = cancellation.is_cancelled();
        if cancelled {
            let pending = state.pending();
            if !pending.is_empty() {
                tracing::warn!(skipped = pending.len(), "run cancelled; skipping units not yet started");
            }
            for index in pending {
                if let Err(e) = state.skip(index, SkipCause::Cancelled) {
                    tracing::error!(error = %e, "rejected status transition");
                }
            }
        }

        self.run_deferred(&mut state, cancelled).await;

        state.into_report(cancelled)
    }

    /// Mark a unit running and hand it to a worker
    fn start(&self, state: &mut RunState<'_>, tasks: &mut JoinSet<UnitOutcome>, index: usize) -> Option<Id> {
        if let Err(e) = state.transition(index, UnitStatus::Running) {
            tracing::error!(error = %e, "rejected status transition");
            return None;
        }

        let task = self.plan(state, index);
        tracing::info!(unit = %task.unit.name, relation = %task.relation, "starting unit");

        let handle = tasks.spawn(execute_unit(Arc::clone(&self.context), task));
        Some(handle.id())
    }

    /// Snapshot what a worker needs from the current state
    fn plan(&self, state: &RunState<'_>, index: usize) -> UnitTask {
        let unit = self.graph.unit_at(index).clone();
        let relation = self.context.target.relation_of(&unit);

        let upstream = self
            .graph
            .parent_indices(index)
            .iter()
            .filter_map(|&parent| {
                state
                    .relation(parent)
                    .map(|r| (self.graph.unit_at(parent).name.clone(), r.clone()))
            })
            .collect();

        let assertions: Vec<_> = self
            .graph
            .assertions_for(&unit.name)
            .into_iter()
            .filter(|a| !is_deferred(self.graph, a))
            .cloned()
            .collect();

        let targets = assertions
            .iter()
            .filter_map(|a| match &a.kind {
                AssertionKind::Relationship { to, .. } => {
                    let target = self.graph.index_of(to)?;
                    state.relation(target).map(|r| (to.clone(), r.clone()))
                }
                _ => None,
            })
            .collect();

        UnitTask {
            index,
            unit,
            relation,
            upstream,
            assertions,
            targets,
        }
    }

    /// Record a worker's outcome; returns units that became ready
    fn apply(&self, state: &mut RunState<'_>, outcome: UnitOutcome) -> Vec<usize> {
        let index = outcome.index;
        let name = &self.graph.unit_at(index).name;

        let relation = match outcome.result {
            Ok(relation) => relation,
            Err(error) => {
                self.fail(state, index, error);
                return Vec::new();
            }
        };

        if let Err(e) = state.transition(index, UnitStatus::Succeeded) {
            tracing::error!(error = %e, "rejected status transition");
            return Vec::new();
        }
        state.set_relation(index, relation);

        let mut blocking = Vec::new();
        for assertion in outcome.assertions {
            if let Some(line) = assertion.describe() {
                if assertion.is_blocking() {
                    blocking.push(line);
                } else {
                    state.add_warning(index, line);
                }
            }
            state.add_assertion(index, assertion);
        }

        if !blocking.is_empty() {
            tracing::error!(unit = %name, failures = blocking.len(), "blocking assertion failed");
            self.fail(state, index, blocking.join("; "));
            return Vec::new();
        }

        tracing::info!(unit = %name, "unit succeeded");

        self.graph
            .child_indices(index)
            .iter()
            .copied()
            .filter(|&child| state.is_ready(child))
            .collect()
    }

    /// Fail a running or succeeded unit and skip its pending descendants
    fn fail(&self, state: &mut RunState<'_>, index: usize, error: String) {
        if let Err(e) = state.transition(index, UnitStatus::Failed) {
            tracing::error!(error = %e, "rejected status transition");
        }
        state.set_error(index, error);

        let skipped = state.skip_descendants(index);
        for &child in &skipped {
            tracing::info!(
                unit = %self.graph.unit_at(child).name,
                upstream = %self.graph.unit_at(index).name,
                "skipping unit; upstream failed"
            );
        }
    }

    /// Evaluate relationship assertions whose target was not guaranteed to
    /// exist when their unit ran
    ///
    /// Every deferred assertion of a unit that succeeded before this phase is
    /// evaluated; blocking failures fail the owner once, with all lines.
    async fn run_deferred(&self, state: &mut RunState<'_>, cancelled: bool) {
        let gate = &self.context.gate;

        let eligible: BTreeSet<usize> = (0..self.graph.len())
            .filter(|&index| state.status(index) == UnitStatus::Succeeded)
            .collect();
        let mut blocking: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for assertion in self.graph.assertions() {
            if !is_deferred(self.graph, assertion) {
                continue;
            }
            let (Some(owner), AssertionKind::Relationship { to, .. }) =
                (self.graph.index_of(&assertion.unit), &assertion.kind)
            else {
                continue;
            };
            if !eligible.contains(&owner) {
                continue;
            }

            let target = self
                .graph
                .index_of(to)
                .filter(|&t| state.status(t) == UnitStatus::Succeeded)
                .and_then(|t| state.relation(t).cloned());

            let outcome = match (cancelled, target, state.relation(owner).cloned()) {
                (true, _, _) => gate.not_evaluated(assertion, "run cancelled"),
                (false, Some(target), Some(own)) => {
                    gate.evaluate(
                        self.context.executor.as_ref(),
                        &self.context.target,
                        assertion,
                        &own,
                        Some(&target),
                    )
                    .await
                }
                (false, _, _) => gate.not_evaluated(assertion, format!("target '{}' did not succeed", to)),
            };

            if outcome.status == AssertionStatus::NotEvaluated {
                tracing::warn!(assertion = %assertion.name, "assertion not evaluated");
            }

            let line = outcome.describe();
            let is_blocking = outcome.is_blocking();
            state.add_assertion(owner, outcome);

            match line {
                Some(line) if is_blocking => {
                    tracing::error!(unit = %assertion.unit, assertion = %assertion.name, "deferred assertion failed");
                    blocking.entry(owner).or_default().push(line);
                }
                Some(line) => state.add_warning(owner, line),
                None => {}
            }
        }

        for (owner, lines) in blocking {
            if let Err(e) = state.transition(owner, UnitStatus::Failed) {
                tracing::error!(error = %e, "rejected status transition");
            }
            state.set_error(owner, lines.join("; "));
        }
    }
}
