//! Reference extraction
//!
//! Finds `{{ ref('model') }}` and `{{ source('source', 'table') }}` calls in
//! unit bodies so upstream lists are known when the graph is built. Bodies
//! are never re-scanned for dependencies at execution time.

use modelrun_core::UnitId;
use regex::Regex;
use std::sync::OnceLock;

/// A reference expression found in a body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// ref('model_name') or ref('package', 'model_name')
    Ref { model_name: String },

    /// source('source_name', 'table_name')
    Source { source_name: String, table_name: String },
}

impl Reference {
    /// Identifier of the unit this reference points at
    pub fn unit_id(&self) -> UnitId {
        match self {
            Self::Ref { model_name } => model_name.clone(),
            Self::Source { source_name, table_name } => source_unit_id(source_name, table_name),
        }
    }
}

/// Identifier used for a source table unit
pub fn source_unit_id(source_name: &str, table_name: &str) -> UnitId {
    format!("{}.{}", source_name, table_name)
}

fn comment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{#.*?#\}").expect("valid comment pattern"))
}

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("valid expression pattern"))
}

fn call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"\b(ref|source)\s*\(\s*['"]([^'"]+)['"]\s*(?:,\s*['"]([^'"]+)['"]\s*)?\)"#,
        )
        .expect("valid call pattern")
    })
}

/// Extract every reference in `sql`, first occurrence first, without repeats
///
/// Only calls inside `{{ ... }}` count; Jinja comments are ignored.
pub fn extract_references(sql: &str) -> Vec<Reference> {
    let without_comments = comment_pattern().replace_all(sql, "");
    let mut references = Vec::new();

    for block in expression_pattern().captures_iter(&without_comments) {
        for call in call_pattern().captures_iter(&block[1]) {
            if let Some(reference) = reference_from_call(&call) {
                if !references.contains(&reference) {
                    references.push(reference);
                }
            }
        }
    }

    references
}

/// Upstream unit identifiers of `sql`, in first-reference order
pub fn extract_upstream(sql: &str) -> Vec<UnitId> {
    extract_references(sql).iter().map(Reference::unit_id).collect()
}

/// Parse a bare reference expression such as `ref('customers')`
///
/// Used for YAML fields like a relationship's `to:`. A plain identifier is
/// read as a model name.
pub fn parse_reference(expression: &str) -> Option<Reference> {
    let trimmed = expression.trim();
    let trimmed = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim();

    if let Some(call) = call_pattern().captures(trimmed) {
        return reference_from_call(&call);
    }

    let is_identifier = !trimmed.is_empty()
        && trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    is_identifier.then(|| Reference::Ref { model_name: trimmed.to_string() })
}

fn reference_from_call(call: &regex::Captures<'_>) -> Option<Reference> {
    let first = call.get(2)?.as_str().to_string();
    let second = call.get(3).map(|m| m.as_str().to_string());

    match &call[1] {
        // Two-argument ref is ref('package', 'model')
        "ref" => Some(Reference::Ref { model_name: second.unwrap_or(first) }),
        "source" => Some(Reference::Source { source_name: first, table_name: second? }),
        _ => None,
    }
}
