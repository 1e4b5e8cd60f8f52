//! Executor trait and the values passed across it

use modelrun_core::{Materialization, Relation, TargetConfig, UnitId, UnitKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything needed to materialize one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeRequest {
    /// Unit identifier
    pub unit: UnitId,

    /// Unit layer
    pub kind: UnitKind,

    /// View or table
    pub materialization: Materialization,

    /// Relation the unit should land in
    pub relation: Relation,

    /// Raw body, as declared
    pub body: String,

    /// Body with every reference substituted
    pub rendered_sql: String,

    /// Resolution map for the unit's upstreams
    pub relations: BTreeMap<UnitId, Relation>,
}

impl MaterializeRequest {
    /// Generic `create or replace` statement for the request
    ///
    /// Dialect-specific executors are free to build their own DDL.
    pub fn ddl(&self) -> String {
        format!(
            "create or replace {} {} as (\n{}\n)",
            self.materialization,
            self.relation.fqn(),
            self.rendered_sql.trim()
        )
    }
}

/// A read-only query, e.g. a compiled assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Stable label (the assertion name)
    pub label: String,

    /// Unit the statement belongs to
    pub unit: UnitId,

    /// SQL text
    pub sql: String,
}

impl Statement {
    pub fn new(label: impl Into<String>, unit: impl Into<UnitId>, sql: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            unit: unit.into(),
            sql: sql.into(),
        }
    }
}

/// Result of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Rows returned
    pub row_count: u64,
}

/// Error reported by an executor; the message is kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutorError {
    /// Error text as the warehouse reported it
    pub message: String,

    /// Warehouse error code, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Trait for executors that run SQL against a warehouse
#[async_trait::async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Get the executor name (e.g., "Snowflake", "Mock")
    fn name(&self) -> &'static str;

    /// Materialize a unit and return the relation it landed in
    ///
    /// Atomicity of the materialization is up to the executor.
    async fn materialize(
        &self,
        request: &MaterializeRequest,
        target: &TargetConfig,
    ) -> Result<Relation, ExecutorError>;

    /// Run a query and report how many rows it returned
    async fn query(&self, statement: &Statement, target: &TargetConfig) -> Result<QueryOutcome, ExecutorError>;
}
