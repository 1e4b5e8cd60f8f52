//! Dry-run executor
//!
//! Records every statement it is handed instead of running it. When an
//! output directory is set, each materialization is written to
//! `<dir>/<unit>.sql` and each query to `<dir>/tests/<label>.sql`.
//! Materializations return the requested relation; queries return zero rows.

use crate::executor::{ExecutorError, MaterializeRequest, QueryOutcome, SqlExecutor, Statement};
use modelrun_core::{Relation, TargetConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Executor that never touches a warehouse
#[derive(Clone, Default)]
pub struct DryRunExecutor {
    output_dir: Option<PathBuf>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write statements under `dir`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Statements recorded so far, in arrival order
    pub async fn statements(&self) -> Vec<String> {
        self.statements.lock().await.clone()
    }

    async fn write(&self, relative: &Path, sql: &str) -> Result<(), ExecutorError> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };

        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::new(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        tokio::fs::write(&path, sql)
            .await
            .map_err(|e| ExecutorError::new(format!("failed to write {}: {}", path.display(), e)))?;

        tracing::debug!(path = %path.display(), "wrote statement");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SqlExecutor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "DryRun"
    }

    async fn materialize(
        &self,
        request: &MaterializeRequest,
        _target: &TargetConfig,
    ) -> Result<Relation, ExecutorError> {
        let ddl = request.ddl();
        self.write(Path::new(&format!("{}.sql", request.unit)), &ddl).await?;
        self.statements.lock().await.push(ddl);
        Ok(request.relation.clone())
    }

    async fn query(&self, statement: &Statement, _target: &TargetConfig) -> Result<QueryOutcome, ExecutorError> {
        let relative = Path::new("tests").join(format!("{}.sql", statement.label));
        self.write(&relative, &statement.sql).await?;
        self.statements.lock().await.push(statement.sql.clone());
        Ok(QueryOutcome::default())
    }
}
