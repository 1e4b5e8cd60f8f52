//! Per-unit run status and its allowed transitions

use serde::{Deserialize, Serialize};
use crate::unit::UnitId;

/// Status of one unit within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Not started yet
    Pending,

    /// Handed to the executor
    Running,

    /// Materialized and passed its blocking assertions
    Succeeded,

    /// Executor error or failed error-severity assertion
    Failed,

    /// Never executed because an upstream failed or the run was cancelled
    Skipped,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether `self -> next` is a legal move
    ///
    /// `succeeded -> failed` is the single move out of a terminal state; the
    /// test gate uses it when an error-severity assertion fails.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Succeeded, Self::Failed)
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition for '{unit}': {from} -> {to}")]
pub struct TransitionError {
    pub unit: UnitId,
    pub from: UnitStatus,
    pub to: UnitStatus,
}
