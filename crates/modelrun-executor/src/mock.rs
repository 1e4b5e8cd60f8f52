//! Mock executor for testing
//!
//! This executor never connects to a warehouse. Materializations succeed and
//! return the requested relation; queries return zero rows. Both can be
//! scripted per unit or per statement label:
//! - Unit testing scheduling and test gate logic
//! - Demos without real credentials
//! - Simulating executor errors and failing assertions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use modelrun_executor::{MockExecutor, SqlExecutor};
//!
//! let executor = MockExecutor::new();
//! executor.add_unit_failure("stg_lineitem", ExecutorError::new("boom")).await;
//! executor.set_row_count("unique_stg_orders_o_orderkey", 3).await;
//!
//! // Inspect what ran afterwards
//! let calls = executor.calls().await;
//! ```

use crate::executor::{ExecutorError, MaterializeRequest, QueryOutcome, SqlExecutor, Statement};
use modelrun_core::{Relation, TargetConfig, UnitId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One recorded executor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Materialize { unit: UnitId, sql: String },
    Query { label: String, unit: UnitId, sql: String },
}

impl ExecutorCall {
    /// Unit the call was made for
    pub fn unit(&self) -> &str {
        match self {
            Self::Materialize { unit, .. } | Self::Query { unit, .. } => unit,
        }
    }
}

/// Tracks concurrent materializations
#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock executor for testing
///
/// Clones share scripted outcomes and the call log, so a test can hand one
/// clone to the engine and inspect the other afterwards.
///
/// # Features
///
/// - Fail materialization of specific units
/// - Return row counts or errors for specific statement labels
/// - Simulate latency, globally or per unit
/// - Record every call and the peak number of concurrent materializations
#[derive(Clone)]
pub struct MockExecutor {
    /// Materialization errors by unit
    unit_failures: Arc<RwLock<HashMap<UnitId, ExecutorError>>>,

    /// Row counts by statement label
    row_counts: Arc<RwLock<HashMap<String, u64>>>,

    /// Query errors by statement label
    query_errors: Arc<RwLock<HashMap<String, ExecutorError>>>,

    /// Extra latency for specific units (milliseconds)
    unit_latency: Arc<RwLock<HashMap<UnitId, u64>>>,

    /// Every call, in the order it arrived
    calls: Arc<RwLock<Vec<ExecutorCall>>>,

    concurrency: Arc<Concurrency>,

    /// Simulate latency for every call (milliseconds)
    latency_ms: u64,

    /// Name to return from name() method
    executor_name: &'static str,
}

impl MockExecutor {
    /// Create a mock executor where everything succeeds
    pub fn new() -> Self {
        MockExecutorBuilder::new().build()
    }

    /// Fail materialization of a unit with the given error
    pub async fn add_unit_failure(&self, unit: impl Into<UnitId>, error: ExecutorError) {
        self.unit_failures.write().await.insert(unit.into(), error);
    }

    /// Return `row_count` rows for the statement with this label
    pub async fn set_row_count(&self, label: impl Into<String>, row_count: u64) {
        self.row_counts.write().await.insert(label.into(), row_count);
    }

    /// Fail the statement with this label
    pub async fn add_query_error(&self, label: impl Into<String>, error: ExecutorError) {
        self.query_errors.write().await.insert(label.into(), error);
    }

    /// Delay materialization of one unit
    pub async fn set_unit_latency(&self, unit: impl Into<UnitId>, latency_ms: u64) {
        self.unit_latency.write().await.insert(unit.into(), latency_ms);
    }

    /// Configure simulated latency for all operations
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set a custom executor name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.executor_name = name;
        self
    }

    /// Every call so far
    pub async fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.read().await.clone()
    }

    /// Units materialized so far, in call order
    pub async fn materialized_units(&self) -> Vec<UnitId> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                ExecutorCall::Materialize { unit, .. } => Some(unit.clone()),
                ExecutorCall::Query { .. } => None,
            })
            .collect()
    }

    /// Labels of the queries run so far, in call order
    pub async fn queried_labels(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                ExecutorCall::Query { label, .. } => Some(label.clone()),
                ExecutorCall::Materialize { .. } => None,
            })
            .collect()
    }

    /// Number of calls made for a unit
    pub async fn call_count(&self, unit: &str) -> usize {
        self.calls.read().await.iter().filter(|c| c.unit() == unit).count()
    }

    /// Highest number of materializations that were in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    /// Clear the call log
    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Simulate latency if configured
    async fn simulate_latency(&self, extra_ms: u64) {
        let total = self.latency_ms + extra_ms;
        if total > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(total)).await;
        }
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SqlExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        self.executor_name
    }

    async fn materialize(
        &self,
        request: &MaterializeRequest,
        _target: &TargetConfig,
    ) -> Result<Relation, ExecutorError> {
        self.calls.write().await.push(ExecutorCall::Materialize {
            unit: request.unit.clone(),
            sql: request.rendered_sql.clone(),
        });

        self.concurrency.enter();
        let extra = self.unit_latency.read().await.get(&request.unit).copied().unwrap_or(0);
        self.simulate_latency(extra).await;
        self.concurrency.exit();

        if let Some(error) = self.unit_failures.read().await.get(&request.unit) {
            return Err(error.clone());
        }

        Ok(request.relation.clone())
    }

    async fn query(&self, statement: &Statement, _target: &TargetConfig) -> Result<QueryOutcome, ExecutorError> {
        self.calls.write().await.push(ExecutorCall::Query {
            label: statement.label.clone(),
            unit: statement.unit.clone(),
            sql: statement.sql.clone(),
        });

        self.simulate_latency(0).await;

        if let Some(error) = self.query_errors.read().await.get(&statement.label) {
            return Err(error.clone());
        }

        let row_count = self.row_counts.read().await.get(&statement.label).copied().unwrap_or(0);
        Ok(QueryOutcome { row_count })
    }
}

/// Builder for creating a MockExecutor with scripted outcomes
///
/// # Example
///
/// ```rust,ignore
/// let executor = MockExecutorBuilder::new()
///     .with_unit_failure("stg_lineitem", "Object 'TPCH.LINEITEM' does not exist")
///     .with_row_count("unique_stg_orders_order_key", 2)
///     .with_latency(5)
///     .build();
/// ```
pub struct MockExecutorBuilder {
    unit_failures: HashMap<UnitId, ExecutorError>,
    row_counts: HashMap<String, u64>,
    query_errors: HashMap<String, ExecutorError>,
    unit_latency: HashMap<UnitId, u64>,
    latency_ms: u64,
    executor_name: &'static str,
}

impl MockExecutorBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            unit_failures: HashMap::new(),
            row_counts: HashMap::new(),
            query_errors: HashMap::new(),
            unit_latency: HashMap::new(),
            latency_ms: 0,
            executor_name: "Mock",
        }
    }

    /// Fail materialization of a unit
    pub fn with_unit_failure(mut self, unit: impl Into<UnitId>, message: impl Into<String>) -> Self {
        self.unit_failures.insert(unit.into(), ExecutorError::new(message));
        self
    }

    /// Fail materialization of a unit with a full error
    pub fn with_unit_error(mut self, unit: impl Into<UnitId>, error: ExecutorError) -> Self {
        self.unit_failures.insert(unit.into(), error);
        self
    }

    /// Return `row_count` rows for a statement label
    pub fn with_row_count(mut self, label: impl Into<String>, row_count: u64) -> Self {
        self.row_counts.insert(label.into(), row_count);
        self
    }

    /// Fail a statement label
    pub fn with_query_error(mut self, label: impl Into<String>, message: impl Into<String>) -> Self {
        self.query_errors.insert(label.into(), ExecutorError::new(message));
        self
    }

    /// Delay materialization of one unit
    pub fn with_unit_latency(mut self, unit: impl Into<UnitId>, latency_ms: u64) -> Self {
        self.unit_latency.insert(unit.into(), latency_ms);
        self
    }

    /// Configure latency
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set executor name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.executor_name = name;
        self
    }

    /// Build the MockExecutor
    pub fn build(self) -> MockExecutor {
        MockExecutor {
            unit_failures: Arc::new(RwLock::new(self.unit_failures)),
            row_counts: Arc::new(RwLock::new(self.row_counts)),
            query_errors: Arc::new(RwLock::new(self.query_errors)),
            unit_latency: Arc::new(RwLock::new(self.unit_latency)),
            calls: Arc::new(RwLock::new(Vec::new())),
            concurrency: Arc::new(Concurrency::default()),
            latency_ms: self.latency_ms,
            executor_name: self.executor_name,
        }
    }
}

impl Default for MockExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
