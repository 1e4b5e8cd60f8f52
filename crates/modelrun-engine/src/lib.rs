//! modelrun engine
//!
//! This crate runs a validated model graph:
//! - Topological scheduling, sequential or bounded-parallel
//! - Execution through a `SqlExecutor` with rendered bodies
//! - The test gate: assertions compiled to zero-row queries
//! - Skip cascades, cancellation, and the final `RunReport`
//!
//! `run` never fails; every run-time error ends up in the report.

pub mod state;
pub mod test_gate;
pub mod driver;
pub mod scheduler;
pub mod compile;

pub use compile::{compile_graph, CompiledUnit};
pub use scheduler::Scheduler;
pub use state::RunState;
pub use test_gate::{CompileError, TestGate};

use modelrun_core::{Config, RunReport, SeverityOverrides, TargetConfig};
use modelrun_executor::SqlExecutor;
use modelrun_project::ModelGraph;
use modelrun_template::TemplateRenderer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::driver::RunContext;

/// Run-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Maximum units in flight (1 = sequential)
    pub threads: usize,

    /// Target handed to every executor call
    pub target: TargetConfig,

    /// Severity overrides by assertion name
    pub severity_overrides: SeverityOverrides,

    /// Template variables
    pub vars: BTreeMap<String, serde_json::Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            target: TargetConfig::default(),
            severity_overrides: SeverityOverrides::default(),
            vars: BTreeMap::new(),
        }
    }
}

impl RunOptions {
    /// Options from a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            threads: config.run.threads,
            target: config.target.clone(),
            severity_overrides: config.severity.clone(),
            vars: config.vars.clone(),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Run every unit of `graph` sequentially with default options
pub async fn run(
    graph: &ModelGraph,
    executor: Arc<dyn SqlExecutor>,
    cancellation: CancellationToken,
) -> RunReport {
    run_with_options(graph, executor, cancellation, RunOptions::default()).await
}

/// Run every unit of `graph`
#[instrument(
    skip_all,
    fields(
        units = graph.len(),
        assertions = graph.assertions().len(),
        threads = options.threads,
        executor = executor.name(),
    )
)]
pub async fn run_with_options(
    graph: &ModelGraph,
    executor: Arc<dyn SqlExecutor>,
    cancellation: CancellationToken,
    options: RunOptions,
) -> RunReport {
    tracing::info!(target_schema = %options.target.schema, "run started");

    let threads = options.threads;
    let context = Arc::new(RunContext {
        executor,
        target: options.target,
        vars: options.vars,
        renderer: TemplateRenderer::new(),
        gate: TestGate::new(options.severity_overrides),
    });

    let report = Scheduler::new(graph, context, threads).run(cancellation).await;

    tracing::info!(
        succeeded = report.summary.succeeded,
        failed = report.summary.failed,
        skipped = report.summary.skipped,
        warnings = report.summary.warnings,
        cancelled = report.cancelled,
        "run finished"
    );

    report
}
