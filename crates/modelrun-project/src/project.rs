//! Project loading
//!
//! Reads a project directory laid out like a dbt project:
//!
//! ```text
//! modelrun_project.yml          name, model-paths, vars
//! models/staging/stg_orders.sql one unit per .sql file, named by file stem
//! models/staging/_sources.yml   source tables
//! models/marts/schema.yml       model config, column tests, model tests
//! ```
//!
//! Units are declared sources first (in file order), then models (in file
//! order). File walks are sorted so declaration order is stable.

use modelrun_core::{Assertion, AssertionKind, Materialization, Relation, Severity, Unit, UnitId, UnitKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::graph::{GraphError, ModelGraph};
use crate::refs::{extract_upstream, parse_reference, source_unit_id};

/// Project file name expected at the project root
pub const PROJECT_FILE: &str = "modelrun_project.yml";

/// Directory name that marks staging models
const STAGING_DIR: &str = "staging";

/// modelrun_project.yml
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectFile {
    /// Project name
    pub name: String,

    /// Directories (relative to the root) holding models and schema files
    #[serde(rename = "model-paths", default = "default_model_paths")]
    pub model_paths: Vec<String>,

    /// Template variables
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
}

fn default_model_paths() -> Vec<String> {
    vec!["models".to_string()]
}

/// A loaded project: units and assertions ready for graph building
#[derive(Debug, Clone)]
pub struct Project {
    /// Project name
    pub name: String,

    /// Project root directory
    pub root: PathBuf,

    /// Units in declaration order
    pub units: Vec<Unit>,

    /// Assertions in declaration order
    pub assertions: Vec<Assertion>,

    /// Template variables from the project file
    pub vars: BTreeMap<String, serde_json::Value>,
}

impl Project {
    /// Load a project from its root directory
    pub fn load(root: &Path) -> Result<Self, ProjectError> {
        let project_path = root.join(PROJECT_FILE);
        if !project_path.exists() {
            return Err(ProjectError::MissingProjectFile(project_path));
        }

        let project_file: ProjectFile = serde_yaml::from_str(&read(&project_path)?)
            .map_err(|e| ProjectError::Yaml {
                path: project_path.clone(),
                message: e.to_string(),
            })?;

        let mut loader = Loader::default();

        for model_path in &project_file.model_paths {
            let dir = root.join(model_path);
            if !dir.is_dir() {
                return Err(ProjectError::MissingModelPath(dir));
            }
            loader.scan(&dir)?;
        }

        let (units, assertions) = loader.finish()?;

        Ok(Self {
            name: project_file.name,
            root: root.to_path_buf(),
            units,
            assertions,
            vars: project_file.vars,
        })
    }

    /// Validate and build the model graph
    pub fn graph(&self) -> Result<ModelGraph, GraphError> {
        ModelGraph::build(self.units.clone(), self.assertions.clone())
    }

    /// Find a unit identifier by name; source tables match on `source.table`
    /// or, when unambiguous, on the bare table name
    pub fn find_unit(&self, name: &str) -> Option<&UnitId> {
        if let Some(unit) = self.units.iter().find(|u| u.name == name) {
            return Some(&unit.name);
        }

        let mut sources = self
            .units
            .iter()
            .filter(|u| u.is_source() && u.name.rsplit('.').next() == Some(name));
        match (sources.next(), sources.next()) {
            (Some(unit), None) => Some(&unit.name),
            _ => None,
        }
    }
}

/// Project loading errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Project file not found: {0}")]
    MissingProjectFile(PathBuf),

    #[error("Model path not found: {0}")]
    MissingModelPath(PathBuf),

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse {path}: {message}")]
    Yaml { path: PathBuf, message: String },

    #[error("{path}: model '{name}' has no SQL file")]
    UndefinedModel { path: PathBuf, name: String },

    #[error("{path}: unknown test '{test}'")]
    UnknownTest { path: PathBuf, test: String },

    #[error("{path}: invalid test '{test}': {message}")]
    InvalidTest { path: PathBuf, test: String, message: String },
}

// ---------------------------------------------------------------------------
// Schema files
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    models: Vec<ModelEntry>,

    #[serde(default)]
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,

    #[serde(default)]
    config: ModelConfig,

    #[serde(default)]
    columns: Vec<ColumnEntry>,

    #[serde(default, alias = "data_tests")]
    tests: Vec<TestEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfig {
    #[serde(default)]
    materialized: Option<Materialization>,

    #[serde(default)]
    kind: Option<UnitKind>,
}

#[derive(Debug, Deserialize)]
struct ColumnEntry {
    name: String,

    #[serde(default, alias = "data_tests")]
    tests: Vec<TestEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    name: String,

    #[serde(default)]
    database: Option<String>,

    /// Defaults to the source name
    #[serde(default)]
    schema: Option<String>,

    #[serde(default)]
    tables: Vec<SourceTable>,
}

#[derive(Debug, Deserialize)]
struct SourceTable {
    name: String,

    #[serde(default)]
    identifier: Option<String>,

    #[serde(default)]
    columns: Vec<ColumnEntry>,

    #[serde(default, alias = "data_tests")]
    tests: Vec<TestEntry>,
}

/// `- unique` or `- accepted_values: { values: [...] }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TestEntry {
    Name(String),
    Configured(BTreeMap<String, TestArgs>),
}

#[derive(Debug, Default, Deserialize)]
struct TestArgs {
    #[serde(default)]
    values: Option<Vec<serde_yaml::Value>>,

    #[serde(default)]
    quote: Option<bool>,

    #[serde(default)]
    to: Option<String>,

    #[serde(default)]
    field: Option<String>,

    #[serde(default)]
    expression: Option<String>,

    #[serde(default)]
    column_name: Option<String>,

    #[serde(default)]
    columns: Option<Vec<String>>,

    #[serde(default)]
    severity: Option<Severity>,

    #[serde(default)]
    config: Option<TestConfig>,

    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TestConfig {
    #[serde(default)]
    severity: Option<Severity>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Loader {
    sources: Vec<Unit>,
    models: Vec<Unit>,
    /// Model entries from schema files, applied once every SQL file is known
    entries: Vec<(PathBuf, ModelEntry)>,
    assertions: Vec<Assertion>,
}

impl Loader {
    fn scan(&mut self, dir: &Path) -> Result<(), ProjectError> {
        let walker = WalkDir::new(dir).sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| ProjectError::Io {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })?;

            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }

            match path.extension().and_then(|e| e.to_str()) {
                Some("sql") => self.add_model(dir, path)?,
                Some("yml") | Some("yaml") => self.add_schema_file(path)?,
                _ => {}
            }
        }

        Ok(())
    }

    fn add_model(&mut self, model_root: &Path, path: &Path) -> Result<(), ProjectError> {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            return Ok(());
        };

        let body = read(path)?;
        let upstream = extract_upstream(&body);

        let in_staging = path
            .strip_prefix(model_root)
            .ok()
            .and_then(|relative| relative.components().next())
            .is_some_and(|first| first.as_os_str() == STAGING_DIR);
        let kind = if in_staging { UnitKind::Staging } else { UnitKind::Mart };

        let unit = Unit::new(name, kind, body)
            .with_upstream(upstream)
            .with_path(path);
        self.models.push(unit);
        Ok(())
    }

    fn add_schema_file(&mut self, path: &Path) -> Result<(), ProjectError> {
        let contents = read(path)?;
        if contents.trim().is_empty() {
            return Ok(());
        }

        let schema: SchemaFile = serde_yaml::from_str(&contents).map_err(|e| ProjectError::Yaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        for source in schema.sources {
            let schema_name = source.schema.clone().unwrap_or_else(|| source.name.clone());

            for table in source.tables {
                let unit_id = source_unit_id(&source.name, &table.name);
                let identifier = table.identifier.clone().unwrap_or_else(|| table.name.clone());
                let relation = Relation::new(source.database.clone(), schema_name.clone(), identifier);

                self.sources.push(Unit::source(unit_id.clone(), relation).with_path(path));
                self.collect_tests(path, &unit_id, &table.columns, &table.tests)?;
            }
        }

        for model in schema.models {
            self.entries.push((path.to_path_buf(), model));
        }

        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<Unit>, Vec<Assertion>), ProjectError> {
        let entries = std::mem::take(&mut self.entries);

        for (path, entry) in entries {
            let Some(unit) = self.models.iter_mut().find(|u| u.name == entry.name) else {
                return Err(ProjectError::UndefinedModel { path, name: entry.name });
            };

            if let Some(materialized) = entry.config.materialized {
                unit.materialization = Some(materialized);
            }
            if let Some(kind) = entry.config.kind {
                unit.kind = kind;
            }

            self.collect_tests(&path, &entry.name, &entry.columns, &entry.tests)?;
        }

        let mut units = self.sources;
        units.extend(self.models);
        Ok((units, self.assertions))
    }

    fn collect_tests(
        &mut self,
        path: &Path,
        unit: &str,
        columns: &[ColumnEntry],
        tests: &[TestEntry],
    ) -> Result<(), ProjectError> {
        for column in columns {
            for test in &column.tests {
                let assertion = build_assertion(path, unit, Some(&column.name), test)?;
                self.assertions.push(assertion);
            }
        }

        for test in tests {
            let assertion = build_assertion(path, unit, None, test)?;
            self.assertions.push(assertion);
        }

        Ok(())
    }
}

/// Turn one YAML test entry into an assertion
fn build_assertion(
    path: &Path,
    unit: &str,
    column: Option<&str>,
    test: &TestEntry,
) -> Result<Assertion, ProjectError> {
    let default_args = TestArgs::default();
    let (test_name, args) = match test {
        TestEntry::Name(name) => (name.as_str(), &default_args),
        TestEntry::Configured(map) => {
            let mut iter = map.iter();
            match (iter.next(), iter.next()) {
                (Some((name, args)), None) => (name.as_str(), args),
                _ => {
                    return Err(ProjectError::InvalidTest {
                        path: path.to_path_buf(),
                        test: map.keys().cloned().collect::<Vec<_>>().join(","),
                        message: "expected exactly one test per entry".to_string(),
                    })
                }
            }
        }
    };

    let invalid = |message: &str| ProjectError::InvalidTest {
        path: path.to_path_buf(),
        test: test_name.to_string(),
        message: message.to_string(),
    };

    let columns: Vec<String> = if let Some(columns) = &args.columns {
        columns.clone()
    } else if let Some(column) = args.column_name.as_deref().or(column) {
        vec![column.to_string()]
    } else {
        Vec::new()
    };

    let kind = match test_name {
        "unique" => AssertionKind::Unique,
        "not_null" => AssertionKind::NotNull,
        "accepted_values" => {
            let values = args.values.as_ref().ok_or_else(|| invalid("missing 'values'"))?;
            let values = values
                .iter()
                .map(yaml_scalar)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid("values must be scalars"))?;
            AssertionKind::AcceptedValues { values, quote: args.quote.unwrap_or(true) }
        }
        "relationships" | "relationship" => {
            let to = args.to.as_deref().ok_or_else(|| invalid("missing 'to'"))?;
            let target = parse_reference(to).ok_or_else(|| invalid("'to' must be ref(...) or source(...)"))?;
            let field = args.field.clone().ok_or_else(|| invalid("missing 'field'"))?;
            AssertionKind::Relationship { to: target.unit_id(), field }
        }
        "expression_is_true" | "custom_predicate" => {
            let expression = args.expression.clone().ok_or_else(|| invalid("missing 'expression'"))?;
            AssertionKind::CustomPredicate { expression }
        }
        other => {
            return Err(ProjectError::UnknownTest {
                path: path.to_path_buf(),
                test: other.to_string(),
            })
        }
    };

    let needs_columns = !matches!(kind, AssertionKind::CustomPredicate { .. });
    if needs_columns && columns.is_empty() {
        return Err(invalid("no column to test"));
    }
    if matches!(kind, AssertionKind::Relationship { .. }) && columns.len() > 1 {
        return Err(invalid("relationships test exactly one column"));
    }

    let severity = args
        .config
        .as_ref()
        .and_then(|c| c.severity)
        .or(args.severity)
        .unwrap_or_default();

    let mut assertion = Assertion::new(unit, columns, kind).with_severity(severity);
    if let Some(name) = &args.name {
        assertion = assertion.with_name(name.clone());
    }
    Ok(assertion)
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn read(path: &Path) -> Result<String, ProjectError> {
    std::fs::read_to_string(path).map_err(|e| ProjectError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_test(yaml: &str) -> TestEntry {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_bare_test_name() {
        let assertion = build_assertion(Path::new("schema.yml"), "stg_orders", Some("o_orderkey"), &parse_test("unique")).unwrap();
        assert_eq!(assertion.kind, AssertionKind::Unique);
        assert_eq!(assertion.columns, vec!["o_orderkey"]);
        assert_eq!(assertion.severity, Severity::Error);
    }

    #[test]
    fn test_accepted_values_with_severity() {
        let test = parse_test(
            r#"
            accepted_values:
              values: ['F', 'O', 'P']
              config:
                severity: warn
            "#,
        );
        let assertion = build_assertion(Path::new("schema.yml"), "stg_orders", Some("o_orderstatus"), &test).unwrap();

        assert_eq!(
            assertion.kind,
            AssertionKind::AcceptedValues { values: vec!["F".into(), "O".into(), "P".into()], quote: true }
        );
        assert_eq!(assertion.severity, Severity::Warn);
    }

    #[test]
    fn test_numeric_accepted_values() {
        let test = parse_test("accepted_values: { values: [1, 2, 3], quote: false }");
        let assertion = build_assertion(Path::new("schema.yml"), "fct_orders", Some("priority"), &test).unwrap();
        assert_eq!(
            assertion.kind,
            AssertionKind::AcceptedValues { values: vec!["1".into(), "2".into(), "3".into()], quote: false }
        );
    }

    #[test]
    fn test_relationship_resolves_ref() {
        let test = parse_test("relationships: { to: \"ref('dim_customers')\", field: customer_key }");
        let assertion = build_assertion(Path::new("schema.yml"), "fct_orders", Some("customer_key"), &test).unwrap();
        assert_eq!(
            assertion.kind,
            AssertionKind::Relationship { to: "dim_customers".into(), field: "customer_key".into() }
        );
    }

    #[test]
    fn test_relationship_rejects_several_columns() {
        let test = parse_test(
            "relationships: { to: \"ref('dim_customers')\", field: customer_key, columns: [customer_key, order_key] }",
        );
        let result = build_assertion(Path::new("schema.yml"), "fct_orders", None, &test);
        assert!(matches!(result, Err(ProjectError::InvalidTest { message, .. }) if message.contains("exactly one column")));
    }

    #[test]
    fn test_model_level_expression() {
        let test = parse_test("expression_is_true: { expression: \"gross_item_sales_amount >= 0\" }");
        let assertion = build_assertion(Path::new("schema.yml"), "fct_orders", None, &test).unwrap();
        assert!(assertion.columns.is_empty());
        assert!(matches!(assertion.kind, AssertionKind::CustomPredicate { .. }));
    }

    #[test]
    fn test_model_level_unique_needs_columns() {
        let result = build_assertion(Path::new("schema.yml"), "fct_orders", None, &parse_test("unique"));
        assert!(matches!(result, Err(ProjectError::InvalidTest { .. })));

        let test = parse_test("unique: { columns: [order_key, line_number] }");
        let assertion = build_assertion(Path::new("schema.yml"), "int_order_items", None, &test).unwrap();
        assert_eq!(assertion.columns, vec!["order_key", "line_number"]);
    }

    #[test]
    fn test_unknown_test_is_rejected() {
        let result = build_assertion(Path::new("schema.yml"), "fct_orders", Some("x"), &parse_test("freshness"));
        assert!(matches!(result, Err(ProjectError::UnknownTest { test, .. }) if test == "freshness"));
    }
}
