//! Execution driver
//!
//! Runs one unit inside a worker task: render the body, materialize it
//! through the executor (sources resolve without a call), then evaluate the
//! unit's immediate assertions. The worker reports back with a `UnitOutcome`
//! and never touches the run state itself.

use modelrun_core::{Assertion, AssertionKind, AssertionOutcome, Relation, TargetConfig, Unit, UnitId};
use modelrun_executor::{MaterializeRequest, SqlExecutor};
use modelrun_template::{RenderContext, TemplateRenderer};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::test_gate::TestGate;

/// Run-wide, read-only inputs shared by every worker
pub struct RunContext {
    pub executor: Arc<dyn SqlExecutor>,
    pub target: TargetConfig,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub renderer: TemplateRenderer,
    pub gate: TestGate,
}

/// Everything a worker needs to run one unit
#[derive(Debug, Clone)]
pub struct UnitTask {
    /// Declaration index
    pub index: usize,

    pub unit: Unit,

    /// Planned relation (target schema, or the unit's override)
    pub relation: Relation,

    /// Resolution map for the unit's direct upstreams
    pub upstream: BTreeMap<UnitId, Relation>,

    /// Assertions evaluated right after materialization
    pub assertions: Vec<Assertion>,

    /// Relations of ancestor relationship targets
    pub targets: BTreeMap<UnitId, Relation>,
}

/// What a worker reports back
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub index: usize,

    /// Materialized relation, or the error text verbatim
    pub result: Result<Relation, String>,

    /// Assertion outcomes, in declaration order; empty when materialization failed
    pub assertions: Vec<AssertionOutcome>,
}

impl UnitOutcome {
    pub fn failed(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            result: Err(error.into()),
            assertions: Vec::new(),
        }
    }
}

/// Run one unit to completion
pub async fn execute_unit(context: Arc<RunContext>, task: UnitTask) -> UnitOutcome {
    let index = task.index;

    let relation = match materialize(&context, &task).await {
        Ok(relation) => relation,
        Err(error) => {
            tracing::error!(unit = %task.unit.name, error = %error, "unit failed");
            return UnitOutcome::failed(index, error);
        }
    };

    tracing::info!(unit = %task.unit.name, relation = %relation, "unit materialized");

    let mut assertions = Vec::with_capacity(task.assertions.len());
    for assertion in &task.assertions {
        let target = relationship_target(assertion, &task, &relation);
        let outcome = context
            .gate
            .evaluate(
                context.executor.as_ref(),
                &context.target,
                assertion,
                &relation,
                target.as_ref(),
            )
            .await;
        assertions.push(outcome);
    }

    UnitOutcome {
        index,
        result: Ok(relation),
        assertions,
    }
}

async fn materialize(context: &RunContext, task: &UnitTask) -> Result<Relation, String> {
    let unit = &task.unit;

    let Some(materialization) = unit.effective_materialization() else {
        tracing::debug!(unit = %unit.name, "source resolved without execution");
        return Ok(task.relation.clone());
    };

    let render_context = RenderContext::new(&context.target)
        .with_this(&task.relation)
        .with_relations(&task.upstream)
        .with_vars(&context.vars);

    let rendered_sql = context
        .renderer
        .render(&unit.body, &render_context, unit.path.as_deref())
        .map_err(|e| e.to_string())?;

    let request = MaterializeRequest {
        unit: unit.name.clone(),
        kind: unit.kind,
        materialization,
        relation: task.relation.clone(),
        body: unit.body.clone(),
        rendered_sql,
        relations: task.upstream.clone(),
    };

    context
        .executor
        .materialize(&request, &context.target)
        .await
        .map_err(|e| e.message)
}

fn relationship_target(assertion: &Assertion, task: &UnitTask, own: &Relation) -> Option<Relation> {
    match &assertion.kind {
        AssertionKind::Relationship { to, .. } if to == &task.unit.name => Some(own.clone()),
        AssertionKind::Relationship { to, .. } => task.targets.get(to).cloned(),
        _ => None,
    }
}
