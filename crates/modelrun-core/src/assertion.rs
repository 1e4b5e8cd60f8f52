//! Data-quality assertions bound to units

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::unit::UnitId;

/// What happens when an assertion fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recorded and surfaced, dependents keep running
    Warn,

    /// Fails the owning unit and blocks its dependents
    #[default]
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Predicate an assertion checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssertionKind {
    /// No two rows share the bound column values
    Unique,

    /// None of the bound columns is null
    NotNull,

    /// Every non-null value is one of `values`
    AcceptedValues {
        values: Vec<String>,
        /// Quote values as string literals
        #[serde(default = "default_true")]
        quote: bool,
    },

    /// Every non-null key exists in `to.field`
    Relationship {
        to: UnitId,
        field: String,
    },

    /// Every row satisfies a boolean SQL expression
    CustomPredicate {
        expression: String,
    },
}

fn default_true() -> bool {
    true
}

impl AssertionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::NotNull => "not_null",
            Self::AcceptedValues { .. } => "accepted_values",
            Self::Relationship { .. } => "relationship",
            Self::CustomPredicate { .. } => "custom_predicate",
        }
    }
}

/// An assertion bound to one unit and zero or more of its columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    /// Stable name used in reports and severity overrides
    pub name: String,

    /// Owning unit
    pub unit: UnitId,

    /// Bound columns (empty for model-level custom predicates)
    #[serde(default)]
    pub columns: Vec<String>,

    /// Predicate
    pub kind: AssertionKind,

    /// Declared severity
    #[serde(default)]
    pub severity: Severity,
}

impl Assertion {
    /// Create an assertion with a generated name and `error` severity
    pub fn new(unit: impl Into<UnitId>, columns: Vec<String>, kind: AssertionKind) -> Self {
        let unit = unit.into();
        let name = Self::generate_name(&unit, &columns, &kind);
        Self {
            name,
            unit,
            columns,
            kind,
            severity: Severity::Error,
        }
    }

    pub fn unique(unit: impl Into<UnitId>, column: impl Into<String>) -> Self {
        Self::new(unit, vec![column.into()], AssertionKind::Unique)
    }

    pub fn not_null(unit: impl Into<UnitId>, column: impl Into<String>) -> Self {
        Self::new(unit, vec![column.into()], AssertionKind::NotNull)
    }

    pub fn accepted_values<I, S>(unit: impl Into<UnitId>, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        Self::new(unit, vec![column.into()], AssertionKind::AcceptedValues { values, quote: true })
    }

    pub fn relationship(
        unit: impl Into<UnitId>,
        column: impl Into<String>,
        to: impl Into<UnitId>,
        field: impl Into<String>,
    ) -> Self {
        Self::new(
            unit,
            vec![column.into()],
            AssertionKind::Relationship { to: to.into(), field: field.into() },
        )
    }

    pub fn custom(unit: impl Into<UnitId>, expression: impl Into<String>) -> Self {
        Self::new(unit, Vec::new(), AssertionKind::CustomPredicate { expression: expression.into() })
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `<kind>_<unit>_<columns>`
    ///
    /// Relationships append the target and field; accepted values and custom
    /// predicates append a short hash of their arguments.
    fn generate_name(unit: &str, columns: &[String], kind: &AssertionKind) -> String {
        let mut parts = vec![kind.as_str().to_string(), sanitize(unit)];
        parts.extend(columns.iter().map(|c| sanitize(c)));

        match kind {
            AssertionKind::Relationship { to, field } => {
                parts.push(sanitize(to));
                parts.push(sanitize(field));
            }
            AssertionKind::AcceptedValues { values, quote } => {
                let mut hasher = Sha256::new();
                for value in values {
                    hasher.update(value.as_bytes());
                    hasher.update([0u8]);
                }
                hasher.update([u8::from(*quote)]);
                parts.push(hex::encode(&hasher.finalize()[..4]));
            }
            AssertionKind::CustomPredicate { expression } => {
                let digest = Sha256::digest(expression.as_bytes());
                parts.push(hex::encode(&digest[..4]));
            }
            AssertionKind::Unique | AssertionKind::NotNull => {}
        }

        parts.join("_")
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
