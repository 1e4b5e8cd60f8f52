//! Run report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.
//!
//! The report deliberately carries no timings or timestamps: two runs of the
//! same graph with the same executor outcomes produce equal reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::assertion::Severity;
use crate::status::UnitStatus;
use crate::unit::{Relation, UnitId};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of one assertion evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionStatus {
    /// Query returned zero rows
    Passed,

    /// Query returned failing rows
    Failed,

    /// Executor could not evaluate the query
    Errored,

    /// Not evaluated (owning unit or relationship target did not succeed)
    NotEvaluated,
}

/// Result of one assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    /// Assertion name
    pub name: String,

    /// Severity after configuration overrides
    pub severity: Severity,

    /// Evaluation outcome
    pub status: AssertionStatus,

    /// Number of failing rows
    pub failures: u64,

    /// Executor error or explanation, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Compiled query
    pub sql: String,
}

impl AssertionOutcome {
    /// Failed or errored with error severity
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
            && matches!(self.status, AssertionStatus::Failed | AssertionStatus::Errored)
    }

    /// Anything other than a pass, rendered as one line
    pub fn describe(&self) -> Option<String> {
        match self.status {
            AssertionStatus::Passed => None,
            AssertionStatus::Failed => Some(format!(
                "{} ({}): {} failing row(s)",
                self.name, self.severity, self.failures
            )),
            AssertionStatus::Errored | AssertionStatus::NotEvaluated => Some(format!(
                "{} ({}): {}",
                self.name,
                self.severity,
                self.message.as_deref().unwrap_or("not evaluated")
            )),
        }
    }
}

/// Why a unit was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Direct upstreams that did not succeed, in declaration order
    UpstreamFailed { blocked_by: Vec<UnitId> },

    /// Run was cancelled before the unit started
    Cancelled,
}

/// Final state of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    /// Final status
    pub status: UnitStatus,

    /// Materialized (or resolved) relation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,

    /// Executor error text, verbatim, or the blocking assertion summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Non-blocking assertion failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Present when status is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    /// Every assertion bound to the unit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionOutcome>,
}

impl UnitResult {
    pub fn new(status: UnitStatus) -> Self {
        Self {
            status,
            relation: None,
            error: None,
            warnings: Vec::new(),
            skip_reason: None,
            assertions: Vec::new(),
        }
    }
}

/// Summary statistics for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Units in the graph
    pub total: usize,

    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Assertions that passed
    pub assertions_passed: usize,

    /// Assertions that failed, errored or were not evaluated
    pub assertions_failed: usize,

    /// Non-blocking problems across all units
    pub warnings: usize,
}

/// Final status snapshot for one execution of the full graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Content digest of the graph that was run
    pub graph_digest: String,

    /// Planned execution order
    pub order: Vec<UnitId>,

    /// Per-unit results
    pub results: BTreeMap<UnitId, UnitResult>,

    /// Whether cancellation was requested during the run
    pub cancelled: bool,

    /// Summary statistics
    pub summary: RunSummary,
}

impl RunReport {
    /// Build a report and compute its summary
    pub fn new(
        graph_digest: impl Into<String>,
        order: Vec<UnitId>,
        results: BTreeMap<UnitId, UnitResult>,
        cancelled: bool,
    ) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            ..RunSummary::default()
        };

        for result in results.values() {
            match result.status {
                UnitStatus::Succeeded => summary.succeeded += 1,
                UnitStatus::Failed => summary.failed += 1,
                UnitStatus::Skipped => summary.skipped += 1,
                UnitStatus::Pending | UnitStatus::Running => {}
            }

            for outcome in &result.assertions {
                if outcome.status == AssertionStatus::Passed {
                    summary.assertions_passed += 1;
                } else {
                    summary.assertions_failed += 1;
                }
            }

            summary.warnings += result.warnings.len();
        }

        Self {
            version: ReportVersion::CURRENT,
            graph_digest: graph_digest.into(),
            order,
            results,
            cancelled,
            summary,
        }
    }

    /// Result for one unit
    pub fn unit(&self, name: &str) -> Option<&UnitResult> {
        self.results.get(name)
    }

    /// Final status for one unit
    pub fn status_of(&self, name: &str) -> Option<UnitStatus> {
        self.results.get(name).map(|r| r.status)
    }

    /// Whether any unit failed
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// Whether every unit succeeded
    pub fn is_success(&self) -> bool {
        self.summary.succeeded == self.summary.total
    }

    /// Units with the given final status, in planned order
    pub fn units_with_status(&self, status: UnitStatus) -> Vec<&UnitId> {
        self.order
            .iter()
            .filter(|id| self.status_of(id) == Some(status))
            .collect()
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}
