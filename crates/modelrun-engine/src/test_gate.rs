//! Test gate
//!
//! Compiles each assertion into a query that returns zero rows when the
//! assertion holds, evaluates it through the executor, and classifies the
//! outcome by severity.

use modelrun_core::{
    Assertion, AssertionKind, AssertionOutcome, AssertionStatus, Relation, Severity,
    SeverityOverrides, TargetConfig,
};
use modelrun_executor::{SqlExecutor, Statement};
use modelrun_project::ModelGraph;

/// Why an assertion could not be compiled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("{kind} assertion has no columns")]
    NoColumns { kind: &'static str },

    #[error("relationship target '{0}' has no resolved relation")]
    UnresolvedTarget(String),

    #[error("relationship assertion binds {count} columns; exactly one is allowed")]
    TooManyColumns { count: usize },
}

/// Compile an assertion against the relation of its unit
///
/// `target` is the relation of a relationship's `to` unit and is ignored for
/// every other kind.
pub fn compile(
    assertion: &Assertion,
    relation: &Relation,
    target: Option<&Relation>,
) -> Result<String, CompileError> {
    let columns = &assertion.columns;
    let needs_columns = !matches!(assertion.kind, AssertionKind::CustomPredicate { .. });
    if needs_columns && columns.is_empty() {
        return Err(CompileError::NoColumns { kind: assertion.kind.as_str() });
    }

    let sql = match &assertion.kind {
        AssertionKind::Unique if columns.len() == 1 => {
            let column = &columns[0];
            format!(
                "select {column} as unique_field, count(*) as n_records\n\
                 from {relation}\n\
                 where {column} is not null\n\
                 group by {column}\n\
                 having count(*) > 1"
            )
        }
        AssertionKind::Unique => {
            let list = columns.join(", ");
            format!(
                "select {list}, count(*) as n_records\n\
                 from {relation}\n\
                 group by {list}\n\
                 having count(*) > 1"
            )
        }
        AssertionKind::NotNull => {
            let predicate = columns
                .iter()
                .map(|c| format!("{c} is null"))
                .collect::<Vec<_>>()
                .join(" or ");
            format!("select *\nfrom {relation}\nwhere {predicate}")
        }
        AssertionKind::AcceptedValues { values, quote } => {
            let list = values
                .iter()
                .map(|v| if *quote { format!("'{}'", v.replace('\'', "''")) } else { v.clone() })
                .collect::<Vec<_>>()
                .join(", ");
            let predicate = columns
                .iter()
                .map(|c| format!("({c} is not null and {c} not in ({list}))"))
                .collect::<Vec<_>>()
                .join(" or ");
            format!("select *\nfrom {relation}\nwhere {predicate}")
        }
        AssertionKind::Relationship { .. } if columns.len() > 1 => {
            return Err(CompileError::TooManyColumns { count: columns.len() });
        }
        AssertionKind::Relationship { to, field } => {
            let target = target.ok_or_else(|| CompileError::UnresolvedTarget(to.clone()))?;
            let column = &columns[0];
            format!(
                "select child.{column} as from_field\n\
                 from {relation} as child\n\
                 left join {target} as parent on child.{column} = parent.{field}\n\
                 where child.{column} is not null and parent.{field} is null"
            )
        }
        AssertionKind::CustomPredicate { expression } => {
            format!("select *\nfrom {relation}\nwhere not ({expression})")
        }
    };

    Ok(sql)
}

/// Relationship assertions whose target is neither the owning unit nor one
/// of its ancestors; they run after every unit has finished
pub fn is_deferred(graph: &ModelGraph, assertion: &Assertion) -> bool {
    match &assertion.kind {
        AssertionKind::Relationship { to, .. } => {
            to != &assertion.unit && !graph.is_upstream_of(to, &assertion.unit)
        }
        _ => false,
    }
}

/// Evaluates assertions with configured severities
#[derive(Debug, Clone, Default)]
pub struct TestGate {
    overrides: SeverityOverrides,
}

impl TestGate {
    pub fn new(overrides: SeverityOverrides) -> Self {
        Self { overrides }
    }

    /// Declared severity, replaced by an override when configured
    pub fn severity_for(&self, assertion: &Assertion) -> Severity {
        self.overrides.get_severity(&assertion.name, assertion.severity)
    }

    /// Outcome for an assertion that could not run
    pub fn not_evaluated(&self, assertion: &Assertion, message: impl Into<String>) -> AssertionOutcome {
        AssertionOutcome {
            name: assertion.name.clone(),
            severity: self.severity_for(assertion),
            status: AssertionStatus::NotEvaluated,
            failures: 0,
            message: Some(message.into()),
            sql: String::new(),
        }
    }

    /// Compile and run one assertion
    pub async fn evaluate(
        &self,
        executor: &dyn SqlExecutor,
        target_config: &TargetConfig,
        assertion: &Assertion,
        relation: &Relation,
        target: Option<&Relation>,
    ) -> AssertionOutcome {
        let severity = self.severity_for(assertion);

        let sql = match compile(assertion, relation, target) {
            Ok(sql) => sql,
            Err(e) => {
                return AssertionOutcome {
                    name: assertion.name.clone(),
                    severity,
                    status: AssertionStatus::Errored,
                    failures: 0,
                    message: Some(e.to_string()),
                    sql: String::new(),
                }
            }
        };

        let statement = Statement::new(assertion.name.clone(), assertion.unit.clone(), sql);
        let (status, failures, message) = match executor.query(&statement, target_config).await {
            Ok(outcome) if outcome.row_count == 0 => (AssertionStatus::Passed, 0, None),
            Ok(outcome) => (AssertionStatus::Failed, outcome.row_count, None),
            Err(e) => (AssertionStatus::Errored, 0, Some(e.message)),
        };

        match status {
            AssertionStatus::Passed => {
                tracing::debug!(assertion = %assertion.name, "assertion passed");
            }
            _ => {
                tracing::warn!(
                    assertion = %assertion.name,
                    unit = %assertion.unit,
                    severity = %severity,
                    failures,
                    "assertion did not pass"
                );
            }
        }

        AssertionOutcome {
            name: assertion.name.clone(),
            severity,
            status,
            failures,
            message,
            sql: statement.sql,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrun_executor::MockExecutorBuilder;

    fn relation(name: &str) -> Relation {
        Relation::new(Some("analytics".into()), "dbt_demo", name)
    }

    #[test]
    fn test_compile_unique_single_column() {
        let sql = compile(&Assertion::unique("stg_orders", "order_key"), &relation("stg_orders"), None).unwrap();
        assert_eq!(
            sql,
            "select order_key as unique_field, count(*) as n_records\n\
             from analytics.dbt_demo.stg_orders\n\
             where order_key is not null\n\
             group by order_key\n\
             having count(*) > 1"
        );
    }

    #[test]
    fn test_compile_unique_multi_column() {
        let assertion = Assertion::new(
            "int_order_items",
            vec!["order_key".into(), "line_number".into()],
            AssertionKind::Unique,
        );
        let sql = compile(&assertion, &relation("int_order_items"), None).unwrap();
        assert!(sql.starts_with("select order_key, line_number, count(*)"));
        assert!(sql.contains("group by order_key, line_number"));
    }

    #[test]
    fn test_compile_not_null() {
        let sql = compile(&Assertion::not_null("stg_orders", "order_key"), &relation("stg_orders"), None).unwrap();
        assert_eq!(sql, "select *\nfrom analytics.dbt_demo.stg_orders\nwhere order_key is null");
    }

    #[test]
    fn test_compile_accepted_values_escapes_quotes() {
        let assertion = Assertion::accepted_values("stg_orders", "status", ["F", "O'P"]);
        let sql = compile(&assertion, &relation("stg_orders"), None).unwrap();
        assert!(sql.ends_with("where (status is not null and status not in ('F', 'O''P'))"));

        let unquoted = Assertion::new(
            "fct_orders",
            vec!["priority".into()],
            AssertionKind::AcceptedValues { values: vec!["1".into(), "2".into()], quote: false },
        );
        let sql = compile(&unquoted, &relation("fct_orders"), None).unwrap();
        assert!(sql.contains("not in (1, 2)"));
    }

    #[test]
    fn test_compile_relationship() {
        let assertion = Assertion::relationship("fct_orders", "customer_key", "dim_customers", "customer_key");
        let sql = compile(&assertion, &relation("fct_orders"), Some(&relation("dim_customers"))).unwrap();
        assert!(sql.contains("left join analytics.dbt_demo.dim_customers as parent"));
        assert!(sql.ends_with("where child.customer_key is not null and parent.customer_key is null"));

        assert_eq!(
            compile(&assertion, &relation("fct_orders"), None),
            Err(CompileError::UnresolvedTarget("dim_customers".into()))
        );
    }

    #[test]
    fn test_compile_relationship_with_two_columns() {
        let assertion = Assertion::new(
            "fct_orders",
            vec!["customer_key".into(), "order_key".into()],
            AssertionKind::Relationship { to: "dim_customers".into(), field: "customer_key".into() },
        );
        assert_eq!(
            compile(&assertion, &relation("fct_orders"), Some(&relation("dim_customers"))),
            Err(CompileError::TooManyColumns { count: 2 })
        );
    }

    #[test]
    fn test_compile_custom_predicate() {
        let sql = compile(&Assertion::custom("fct_orders", "items > 0"), &relation("fct_orders"), None).unwrap();
        assert_eq!(sql, "select *\nfrom analytics.dbt_demo.fct_orders\nwhere not (items > 0)");
    }

    #[test]
    fn test_compile_without_columns() {
        let assertion = Assertion::new("stg_orders", Vec::new(), AssertionKind::NotNull);
        assert_eq!(
            compile(&assertion, &relation("stg_orders"), None),
            Err(CompileError::NoColumns { kind: "not_null" })
        );
    }

    #[test]
    fn test_deferred_only_when_target_is_not_an_ancestor() {
        let graph = ModelGraph::build(
            vec![
                modelrun_core::Unit::new("stg_orders", modelrun_core::UnitKind::Staging, ""),
                modelrun_core::Unit::new("dim_customers", modelrun_core::UnitKind::Mart, ""),
                modelrun_core::Unit::new("fct_orders", modelrun_core::UnitKind::Mart, "")
                    .with_upstream(["stg_orders"]),
            ],
            Vec::new(),
        )
        .unwrap();

        let to_ancestor = Assertion::relationship("fct_orders", "order_key", "stg_orders", "order_key");
        let to_self = Assertion::relationship("fct_orders", "parent_key", "fct_orders", "order_key");
        let to_sibling = Assertion::relationship("fct_orders", "customer_key", "dim_customers", "customer_key");

        assert!(!is_deferred(&graph, &to_ancestor));
        assert!(!is_deferred(&graph, &to_self));
        assert!(is_deferred(&graph, &to_sibling));
        assert!(!is_deferred(&graph, &Assertion::unique("fct_orders", "order_key")));
    }

    #[tokio::test]
    async fn test_evaluate_classifies_outcomes() {
        let passing = Assertion::not_null("stg_orders", "order_key");
        let failing = Assertion::unique("stg_orders", "order_key");
        let erroring = Assertion::accepted_values("stg_orders", "status", ["F"]).with_severity(Severity::Warn);

        let executor = MockExecutorBuilder::new()
            .with_row_count(failing.name.clone(), 4)
            .with_query_error(erroring.name.clone(), "invalid identifier 'STATUS'")
            .build();
        let gate = TestGate::default();
        let target = TargetConfig::default();
        let rel = relation("stg_orders");

        let outcome = gate.evaluate(&executor, &target, &passing, &rel, None).await;
        assert_eq!(outcome.status, AssertionStatus::Passed);
        assert!(!outcome.is_blocking());

        let outcome = gate.evaluate(&executor, &target, &failing, &rel, None).await;
        assert_eq!(outcome.status, AssertionStatus::Failed);
        assert_eq!(outcome.failures, 4);
        assert!(outcome.is_blocking());

        let outcome = gate.evaluate(&executor, &target, &erroring, &rel, None).await;
        assert_eq!(outcome.status, AssertionStatus::Errored);
        assert_eq!(outcome.message.as_deref(), Some("invalid identifier 'STATUS'"));
        assert!(!outcome.is_blocking());
    }

    #[tokio::test]
    async fn test_overrides_replace_declared_severity() {
        let assertion = Assertion::unique("stg_orders", "order_key");
        let mut overrides = SeverityOverrides::default();
        overrides.set_override(assertion.name.clone(), Severity::Warn);

        let executor = MockExecutorBuilder::new().with_row_count(assertion.name.clone(), 1).build();
        let gate = TestGate::new(overrides);

        let outcome = gate
            .evaluate(&executor, &TargetConfig::default(), &assertion, &relation("stg_orders"), None)
            .await;
        assert_eq!(outcome.severity, Severity::Warn);
        assert!(!outcome.is_blocking());
    }
}
