//! Configuration schema (modelrun.toml)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use crate::assertion::Severity;
use crate::unit::{Relation, Unit};

/// Environment variable that overrides `run.threads`
pub const THREADS_ENV: &str = "MODELRUN_THREADS";

/// Warehouse target handed to every executor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Warehouse type (snowflake, bigquery, postgres, ...)
    #[serde(rename = "type", default = "default_warehouse_type")]
    pub warehouse_type: String,

    /// Database/project that units materialize into
    #[serde(default)]
    pub database: Option<String>,

    /// Schema/dataset that units materialize into
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Connection settings (warehouse-specific, passed through untouched)
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

fn default_warehouse_type() -> String {
    "generic".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            warehouse_type: default_warehouse_type(),
            database: None,
            schema: default_schema(),
            settings: HashMap::new(),
        }
    }
}

impl TargetConfig {
    /// Relation a unit named `identifier` lands in
    pub fn relation_for(&self, identifier: &str) -> Relation {
        Relation::new(self.database.clone(), self.schema.clone(), identifier)
    }

    /// Relation a unit resolves to: its own override, or the target schema
    pub fn relation_of(&self, unit: &Unit) -> Relation {
        unit.relation
            .clone()
            .unwrap_or_else(|| self.relation_for(&unit.name))
    }
}

/// Scheduling knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of units executing at once (1 = sequential)
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_threads() -> usize {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { threads: default_threads() }
    }
}

/// Severity overrides keyed by assertion name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityOverrides {
    /// Map of assertion name to severity override
    #[serde(default)]
    pub overrides: HashMap<String, Severity>,
}

impl SeverityOverrides {
    /// Get severity for an assertion, or its declared default
    pub fn get_severity(&self, assertion: &str, default: Severity) -> Severity {
        self.overrides
            .get(assertion)
            .copied()
            .unwrap_or(default)
    }

    /// Set severity override for an assertion
    pub fn set_override(&mut self, assertion: impl Into<String>, severity: Severity) {
        self.overrides.insert(assertion.into(), severity);
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Warehouse target
    #[serde(default)]
    pub target: TargetConfig,

    /// Scheduling
    #[serde(default)]
    pub run: RunConfig,

    /// Assertion severity overrides
    #[serde(default)]
    pub severity: SeverityOverrides,

    /// Template variables available through `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            run: RunConfig::default(),
            severity: SeverityOverrides::default(),
            vars: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Apply `MODELRUN_THREADS` if it is set
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(raw) = std::env::var(THREADS_ENV) {
            self.run.threads = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{THREADS_ENV}={raw} is not a number")))?;
            self.validate()?;
        }
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run.threads == 0 {
            return Err(ConfigError::InvalidValue("run.threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
