//! Render context for unit bodies

use modelrun_core::{Relation, TargetConfig, UnitId};
use minijinja::Value as MinijinjaValue;
use serde::Serialize;
use std::collections::BTreeMap;

/// Name of the context entry holding the resolution map
pub(crate) const RELATIONS_KEY: &str = "relations";

/// Name of the context entry holding template variables
pub(crate) const VARS_KEY: &str = "vars";

/// Everything a body can see while rendering
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    /// Relation the unit being rendered lands in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub this: Option<String>,

    /// Run-wide target
    pub target: TargetContext,

    /// Resolution map: unit identifier to fully qualified relation
    pub relations: BTreeMap<UnitId, String>,

    /// Template variables
    pub vars: BTreeMap<String, serde_json::Value>,
}

/// Target exposed as `{{ target.schema }}` and friends
#[derive(Debug, Clone, Serialize)]
pub struct TargetContext {
    #[serde(rename = "type")]
    pub target_type: String,
    pub database: Option<String>,
    pub schema: String,
}

impl Default for TargetContext {
    fn default() -> Self {
        Self::from(&TargetConfig::default())
    }
}

impl From<&TargetConfig> for TargetContext {
    fn from(target: &TargetConfig) -> Self {
        Self {
            target_type: target.warehouse_type.clone(),
            database: target.database.clone(),
            schema: target.schema.clone(),
        }
    }
}

impl RenderContext {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            target: TargetContext::from(target),
            ..Self::default()
        }
    }

    /// Set the relation of the unit being rendered
    pub fn with_this(mut self, relation: &Relation) -> Self {
        self.this = Some(relation.fqn());
        self
    }

    /// Add one entry to the resolution map
    pub fn with_relation(mut self, unit: impl Into<UnitId>, relation: &Relation) -> Self {
        self.relations.insert(unit.into(), relation.fqn());
        self
    }

    /// Add every entry of a resolution map
    pub fn with_relations<'a, I>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = (&'a UnitId, &'a Relation)>,
    {
        for (unit, relation) in relations {
            self.relations.insert(unit.clone(), relation.fqn());
        }
        self
    }

    pub fn with_vars(mut self, vars: &BTreeMap<String, serde_json::Value>) -> Self {
        self.vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Convert to MiniJinja value for rendering
    pub fn to_minijinja_value(&self) -> MinijinjaValue {
        MinijinjaValue::from_serialize(self)
    }
}
