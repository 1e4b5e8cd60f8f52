//! Transformation units and the relations they materialize into

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unit identifier (model name, or `source_name.table_name` for sources)
pub type UnitId = String;

/// Layer a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Raw table loaded outside of modelrun; never executed
    Source,

    /// Light-touch cleanup of a source
    Staging,

    /// Business-facing model built from staging models
    Mart,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Staging => "staging",
            Self::Mart => "mart",
        }
    }

    /// Materialization used when the unit does not configure one
    pub fn default_materialization(&self) -> Option<Materialization> {
        match self {
            Self::Source => None,
            Self::Staging => Some(Materialization::View),
            Self::Mart => Some(Materialization::Table),
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executor persists a unit's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    View,
    Table,
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// A queryable object in the warehouse
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Database/project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Schema/dataset name
    pub schema: String,

    /// Table or view name
    pub identifier: String,
}

impl Relation {
    pub fn new(database: Option<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Fully qualified name, omitting the database when unset
    pub fn fqn(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}.{}", database, self.schema, self.identifier),
            None => format!("{}.{}", self.schema, self.identifier),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// One named transformation
///
/// Built once by the configuration source and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unique identifier
    pub name: UnitId,

    /// Layer (source, staging, mart)
    pub kind: UnitKind,

    /// Declared upstream units, in first-reference order, without duplicates
    #[serde(default)]
    pub upstream: Vec<UnitId>,

    /// Transformation text handed to the executor (empty for sources)
    #[serde(default)]
    pub body: String,

    /// Explicit materialization; falls back to the kind's default
    #[serde(default)]
    pub materialization: Option<Materialization>,

    /// Explicit relation; sources always carry one
    #[serde(default)]
    pub relation: Option<Relation>,

    /// File the unit was loaded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Unit {
    /// Create a unit with a body and no upstreams
    pub fn new(name: impl Into<UnitId>, kind: UnitKind, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            upstream: Vec::new(),
            body: body.into(),
            materialization: None,
            relation: None,
            path: None,
        }
    }

    /// Create a source unit pointing at an existing relation
    pub fn source(name: impl Into<UnitId>, relation: Relation) -> Self {
        Self {
            name: name.into(),
            kind: UnitKind::Source,
            upstream: Vec::new(),
            body: String::new(),
            materialization: None,
            relation: Some(relation),
            path: None,
        }
    }

    /// Set the upstream list, dropping repeated identifiers
    pub fn with_upstream<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        self.upstream.clear();
        for id in upstream {
            let id = id.into();
            if !self.upstream.contains(&id) {
                self.upstream.push(id);
            }
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_materialization(mut self, materialization: Materialization) -> Self {
        self.materialization = Some(materialization);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn is_source(&self) -> bool {
        self.kind == UnitKind::Source
    }

    /// Materialization after applying the kind default
    pub fn effective_materialization(&self) -> Option<Materialization> {
        if self.is_source() {
            return None;
        }
        self.materialization.or_else(|| self.kind.default_materialization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_is_deduplicated_in_order() {
        let unit = Unit::new("int_order_items", UnitKind::Mart, "select 1")
            .with_upstream(["stg_orders", "stg_lineitem", "stg_orders"]);

        assert_eq!(unit.upstream, vec!["stg_orders", "stg_lineitem"]);
    }

    #[test]
    fn test_materialization_defaults_follow_kind() {
        let staging = Unit::new("stg_orders", UnitKind::Staging, "select 1");
        let mart = Unit::new("fct_orders", UnitKind::Mart, "select 1");
        let pinned = Unit::new("fct_orders", UnitKind::Mart, "select 1")
            .with_materialization(Materialization::View);
        let source = Unit::source("tpch.orders", Relation::new(None, "tpch_sf1", "orders"));

        assert_eq!(staging.effective_materialization(), Some(Materialization::View));
        assert_eq!(mart.effective_materialization(), Some(Materialization::Table));
        assert_eq!(pinned.effective_materialization(), Some(Materialization::View));
        assert_eq!(source.effective_materialization(), None);
    }

    #[test]
    fn test_relation_fqn() {
        let with_db = Relation::new(Some("analytics".into()), "dbt_demo", "fct_orders");
        let without_db = Relation::new(None, "dbt_demo", "fct_orders");

        assert_eq!(with_db.fqn(), "analytics.dbt_demo.fct_orders");
        assert_eq!(without_db.to_string(), "dbt_demo.fct_orders");
    }
}
