//! modelrun core
//!
//! Domain model shared by every modelrun crate: transformation units, the
//! relations they materialize into, data-quality assertions, per-unit run
//! status, the run report and run configuration.
//! Report fields and status names are serialized - treat them as public API.

pub mod unit;
pub mod assertion;
pub mod status;
pub mod report;
pub mod config;

pub use unit::{Unit, UnitId, UnitKind, Materialization, Relation};
pub use assertion::{Assertion, AssertionKind, Severity};
pub use status::{UnitStatus, TransitionError};
pub use report::{RunReport, ReportVersion, RunSummary, UnitResult, AssertionOutcome, AssertionStatus, SkipReason};
pub use config::{Config, ConfigError, TargetConfig, RunConfig, SeverityOverrides};
