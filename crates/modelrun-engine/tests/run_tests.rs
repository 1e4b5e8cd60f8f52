//! Integration tests for running graphs end to end against the mock executor

mod fixtures;

use fixtures::*;
use modelrun_core::{
    Assertion, AssertionStatus, Relation, Severity, SeverityOverrides, SkipReason, TargetConfig, Unit,
    UnitKind, UnitStatus,
};
use modelrun_engine::{run, run_with_options, RunOptions};
use modelrun_executor::{
    ExecutorCall, ExecutorError, MaterializeRequest, MockExecutor, MockExecutorBuilder, QueryOutcome, SqlExecutor,
    Statement,
};
use modelrun_project::ModelGraph;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn options(threads: usize) -> RunOptions {
    RunOptions::default().with_threads(threads)
}

#[tokio::test]
async fn test_example_graph_runs_in_dependency_order() {
    let graph = example_graph();
    let executor = MockExecutor::new();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    let expected = vec!["stg_orders", "stg_lineitem", "int_order_items", "fct_orders"];
    assert_eq!(report.order, expected);
    assert_eq!(executor.materialized_units().await, expected);

    for name in &expected {
        assert_eq!(report.status_of(name), Some(UnitStatus::Succeeded));
    }
    assert!(report.is_success());
    assert!(!report.cancelled);
    assert_eq!(report.summary.total, 4);
}

#[tokio::test]
async fn test_execution_failure_skips_descendants() {
    let graph = example_graph();
    let executor = MockExecutorBuilder::new()
        .with_unit_failure("stg_lineitem", "Object 'RAW.LINEITEM' does not exist or not authorized.")
        .build();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    assert_eq!(report.status_of("stg_orders"), Some(UnitStatus::Succeeded));
    assert_eq!(report.status_of("stg_lineitem"), Some(UnitStatus::Failed));
    assert_eq!(
        report.unit("stg_lineitem").unwrap().error.as_deref(),
        Some("Object 'RAW.LINEITEM' does not exist or not authorized.")
    );

    assert_eq!(report.status_of("int_order_items"), Some(UnitStatus::Skipped));
    assert_eq!(
        report.unit("int_order_items").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { blocked_by: vec!["stg_lineitem".into()] })
    );
    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Skipped));
    assert_eq!(
        report.unit("fct_orders").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { blocked_by: vec!["int_order_items".into()] })
    );

    // Skipped units never reach the executor
    assert_eq!(executor.materialized_units().await, vec!["stg_orders", "stg_lineitem"]);
    assert!(report.has_failures());
    assert_eq!(report.summary.skipped, 2);
}

#[tokio::test]
async fn test_rerun_yields_identical_report() {
    let graph = tpch_graph();
    let executor = MockExecutor::new();

    let first = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;
    let second = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[tokio::test]
async fn test_sources_resolve_without_materialization() {
    let graph = tpch_graph();
    let executor = MockExecutor::new();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    assert_eq!(report.status_of("tpch.orders"), Some(UnitStatus::Succeeded));
    assert_eq!(
        report.unit("tpch.orders").unwrap().relation.as_ref().map(Relation::fqn),
        Some("snowflake_sample_data.tpch_sf1.orders".to_string())
    );
    assert!(!executor.materialized_units().await.iter().any(|u| u.starts_with("tpch.")));

    // Source assertions still run
    assert!(executor.queried_labels().await.contains(&unique_name("tpch.orders", "o_orderkey")));
}

#[tokio::test]
async fn test_failed_unique_assertion_fails_unit() {
    let graph = tpch_graph();
    let failing = unique_name("stg_orders", "order_key");
    let executor = MockExecutorBuilder::new().with_row_count(failing.clone(), 3).build();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    let stg_orders = report.unit("stg_orders").unwrap();
    assert_eq!(stg_orders.status, UnitStatus::Failed);
    assert!(stg_orders.error.as_deref().unwrap().contains(&failing));
    assert!(stg_orders.relation.is_some());

    let outcome = stg_orders.assertions.iter().find(|a| a.name == failing).unwrap();
    assert_eq!(outcome.status, AssertionStatus::Failed);
    assert_eq!(outcome.failures, 3);
    assert_eq!(outcome.severity, Severity::Error);

    // Every assertion of the unit was still evaluated
    assert_eq!(stg_orders.assertions.len(), 3);

    assert_eq!(report.status_of("stg_lineitem"), Some(UnitStatus::Succeeded));
    assert_eq!(
        report.unit("int_order_items").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { blocked_by: vec!["stg_orders".into()] })
    );
    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Skipped));
    assert_eq!(executor.call_count("int_order_items").await, 0);
}

#[tokio::test]
async fn test_warn_failure_does_not_block_dependents() {
    let graph = tpch_graph();
    let warn = Assertion::accepted_values("stg_orders", "status_code", ["F", "O", "P"]).name;
    let executor = MockExecutorBuilder::new().with_row_count(warn.clone(), 2).build();

    let report = run(&graph, Arc::new(executor), CancellationToken::new()).await;

    let stg_orders = report.unit("stg_orders").unwrap();
    assert_eq!(stg_orders.status, UnitStatus::Succeeded);
    assert_eq!(stg_orders.warnings.len(), 1);
    assert!(stg_orders.warnings[0].contains(&warn));
    assert!(stg_orders.error.is_none());

    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Succeeded));
    assert!(report.is_success());
    assert_eq!(report.summary.warnings, 1);
    assert_eq!(report.summary.assertions_failed, 1);
}

#[tokio::test]
async fn test_assertion_executor_error_fails_unit() {
    let graph = tpch_graph();
    let label = not_null_name("stg_lineitem", "order_key");
    let executor = MockExecutorBuilder::new()
        .with_query_error(label.clone(), "SQL compilation error: invalid identifier 'ORDER_KEY'")
        .build();

    let report = run(&graph, Arc::new(executor), CancellationToken::new()).await;

    let stg_lineitem = report.unit("stg_lineitem").unwrap();
    assert_eq!(stg_lineitem.status, UnitStatus::Failed);
    assert!(stg_lineitem
        .error
        .as_deref()
        .unwrap()
        .contains("invalid identifier 'ORDER_KEY'"));
    assert_eq!(stg_lineitem.assertions[0].status, AssertionStatus::Errored);
}

#[tokio::test]
async fn test_severity_override_downgrades_failure() {
    let graph = tpch_graph();
    let failing = unique_name("stg_orders", "order_key");
    let executor = MockExecutorBuilder::new().with_row_count(failing.clone(), 3).build();

    let mut overrides = SeverityOverrides::default();
    overrides.set_override(failing.clone(), Severity::Warn);
    let options = RunOptions {
        severity_overrides: overrides,
        ..RunOptions::default()
    };

    let report = run_with_options(&graph, Arc::new(executor), CancellationToken::new(), options).await;

    assert_eq!(report.status_of("stg_orders"), Some(UnitStatus::Succeeded));
    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Succeeded));
    let outcome = report
        .unit("stg_orders")
        .unwrap()
        .assertions
        .iter()
        .find(|a| a.name == failing)
        .unwrap();
    assert_eq!(outcome.severity, Severity::Warn);
}

#[tokio::test]
async fn test_cancelled_before_start_skips_everything() {
    let graph = tpch_graph();
    let executor = MockExecutor::new();
    let token = CancellationToken::new();
    token.cancel();

    let report = run(&graph, Arc::new(executor.clone()), token).await;

    assert!(report.cancelled);
    assert_eq!(report.summary.skipped, graph.len());
    for name in &report.order {
        assert_eq!(report.unit(name).unwrap().skip_reason, Some(SkipReason::Cancelled));
    }
    assert!(executor.calls().await.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_run_lets_in_flight_units_finish() {
    let graph = example_graph();
    let executor = MockExecutorBuilder::new().with_unit_latency("stg_orders", 200).build();
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = run(&graph, Arc::new(executor.clone()), token).await;

    assert!(report.cancelled);
    assert_eq!(report.status_of("stg_orders"), Some(UnitStatus::Succeeded));
    for name in ["stg_lineitem", "int_order_items", "fct_orders"] {
        assert_eq!(report.status_of(name), Some(UnitStatus::Skipped));
        assert_eq!(report.unit(name).unwrap().skip_reason, Some(SkipReason::Cancelled));
    }
    assert_eq!(executor.materialized_units().await, vec!["stg_orders"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_and_sequential_reports_match() {
    let graph = tpch_graph();

    let build = || {
        MockExecutorBuilder::new()
            .with_unit_latency("stg_orders", 50)
            .with_unit_latency("stg_lineitem", 50)
            .with_row_count(Assertion::custom("fct_orders", "items > 0").name, 1)
            .build()
    };

    let sequential_executor = build();
    let sequential = run_with_options(
        &graph,
        Arc::new(sequential_executor.clone()),
        CancellationToken::new(),
        options(1),
    )
    .await;

    let parallel_executor = build();
    let parallel = run_with_options(
        &graph,
        Arc::new(parallel_executor.clone()),
        CancellationToken::new(),
        options(4),
    )
    .await;

    assert_eq!(sequential, parallel);
    assert_eq!(sequential_executor.peak_concurrency(), 1);
    assert_eq!(parallel_executor.peak_concurrency(), 2);
    assert_eq!(parallel.status_of("fct_orders"), Some(UnitStatus::Failed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_failure_matches_sequential() {
    let graph = tpch_graph();
    let build = || {
        MockExecutorBuilder::new()
            .with_unit_failure("stg_orders", "boom")
            .with_unit_latency("stg_lineitem", 30)
            .build()
    };

    let sequential = run_with_options(&graph, Arc::new(build()), CancellationToken::new(), options(1)).await;
    let parallel = run_with_options(&graph, Arc::new(build()), CancellationToken::new(), options(3)).await;

    assert_eq!(sequential, parallel);
    assert_eq!(parallel.status_of("stg_lineitem"), Some(UnitStatus::Succeeded));
    assert_eq!(
        parallel.unit("int_order_items").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { blocked_by: vec!["stg_orders".into()] })
    );
}

#[tokio::test]
async fn test_rendered_bodies_contain_upstream_relations() {
    let graph = tpch_graph();
    let executor = MockExecutor::new();
    let options = RunOptions {
        target: TargetConfig {
            database: Some("analytics".into()),
            schema: "dbt_demo".into(),
            ..TargetConfig::default()
        },
        ..RunOptions::default()
    };

    let report = run_with_options(&graph, Arc::new(executor.clone()), CancellationToken::new(), options).await;
    assert!(report.is_success());

    let sql_for = |calls: &[ExecutorCall], unit: &str| {
        calls
            .iter()
            .find_map(|call| match call {
                ExecutorCall::Materialize { unit: u, sql } if u == unit => Some(sql.clone()),
                _ => None,
            })
            .unwrap()
    };
    let calls = executor.calls().await;

    let stg_orders = sql_for(&calls, "stg_orders");
    assert!(stg_orders.contains("from snowflake_sample_data.tpch_sf1.orders"));

    let int_items = sql_for(&calls, "int_order_items");
    assert!(int_items.contains("from analytics.dbt_demo.stg_orders o"));
    assert!(int_items.contains("join analytics.dbt_demo.stg_lineitem l"));
    assert!(!int_items.contains("{{"));

    assert_eq!(
        report.unit("fct_orders").unwrap().relation.as_ref().map(Relation::fqn),
        Some("analytics.dbt_demo.fct_orders".to_string())
    );
}

#[tokio::test]
async fn test_render_failure_is_an_execution_error() {
    let graph = ModelGraph::build(
        vec![
            Unit::new("stg_orders", UnitKind::Staging, "select * from raw.orders where d > '{{ var(\"cutoff\") }}'"),
            Unit::new("fct_orders", UnitKind::Mart, "select * from {{ ref('stg_orders') }}")
                .with_upstream(["stg_orders"]),
        ],
        Vec::new(),
    )
    .unwrap();
    let executor = MockExecutor::new();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    assert_eq!(report.status_of("stg_orders"), Some(UnitStatus::Failed));
    assert!(report.unit("stg_orders").unwrap().error.as_deref().unwrap().contains("cutoff"));
    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Skipped));
    assert!(executor.calls().await.is_empty());
}

fn deferred_graph() -> ModelGraph {
    ModelGraph::build(
        vec![
            Unit::new("stg_orders", UnitKind::Staging, "select 1 as order_key, 7 as customer_key"),
            Unit::new("dim_customers", UnitKind::Mart, "select 7 as customer_key"),
            Unit::new("fct_orders", UnitKind::Mart, "select * from {{ ref('stg_orders') }}")
                .with_upstream(["stg_orders"]),
            Unit::new("rpt_orders", UnitKind::Mart, "select * from {{ ref('fct_orders') }}")
                .with_upstream(["fct_orders"]),
        ],
        vec![Assertion::relationship("fct_orders", "customer_key", "dim_customers", "customer_key")],
    )
    .unwrap()
}

#[tokio::test]
async fn test_deferred_relationship_with_failed_target_is_not_evaluated() {
    let graph = deferred_graph();
    let executor = MockExecutorBuilder::new().with_unit_failure("dim_customers", "boom").build();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    let fct_orders = report.unit("fct_orders").unwrap();
    assert_eq!(fct_orders.status, UnitStatus::Succeeded);
    assert_eq!(fct_orders.assertions[0].status, AssertionStatus::NotEvaluated);
    assert_eq!(fct_orders.warnings.len(), 1);
    assert!(fct_orders.warnings[0].contains("dim_customers"));
    assert!(executor.queried_labels().await.is_empty());
}

#[tokio::test]
async fn test_deferred_relationship_failure_fails_owner_only() {
    let graph = deferred_graph();
    let relationship = Assertion::relationship("fct_orders", "customer_key", "dim_customers", "customer_key");
    let executor = MockExecutorBuilder::new().with_row_count(relationship.name.clone(), 2).build();

    let report = run_with_options(&graph, Arc::new(executor.clone()), CancellationToken::new(), options(2)).await;

    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Failed));
    assert!(report.unit("fct_orders").unwrap().error.as_deref().unwrap().contains(&relationship.name));

    // rpt_orders already ran before the deferred phase
    assert_eq!(report.status_of("rpt_orders"), Some(UnitStatus::Succeeded));
    assert_eq!(executor.queried_labels().await, vec![relationship.name.clone()]);

    let sql = &report.unit("fct_orders").unwrap().assertions[0].sql;
    assert!(sql.contains("left join public.dim_customers as parent"));
}

#[tokio::test]
async fn test_every_deferred_relationship_is_evaluated() {
    let to_customers = Assertion::relationship("fct_orders", "customer_key", "dim_customers", "customer_key");
    let to_parts = Assertion::relationship("fct_orders", "part_key", "dim_parts", "part_key");

    let graph = ModelGraph::build(
        vec![
            Unit::new("stg_orders", UnitKind::Staging, "select 1 as order_key, 7 as customer_key, 3 as part_key"),
            Unit::new("dim_customers", UnitKind::Mart, "select 7 as customer_key"),
            Unit::new("dim_parts", UnitKind::Mart, "select 3 as part_key"),
            Unit::new("fct_orders", UnitKind::Mart, "select * from {{ ref('stg_orders') }}")
                .with_upstream(["stg_orders"]),
        ],
        vec![to_customers.clone(), to_parts.clone()],
    )
    .unwrap();

    let executor = MockExecutorBuilder::new()
        .with_row_count(to_customers.name.clone(), 2)
        .with_row_count(to_parts.name.clone(), 3)
        .build();

    let report = run(&graph, Arc::new(executor.clone()), CancellationToken::new()).await;

    let fct_orders = report.unit("fct_orders").unwrap();
    assert_eq!(fct_orders.status, UnitStatus::Failed);
    assert_eq!(fct_orders.assertions.len(), 2);
    assert!(fct_orders.assertions.iter().all(|a| a.status == AssertionStatus::Failed));

    let error = fct_orders.error.as_deref().unwrap();
    assert!(error.contains(&to_customers.name));
    assert!(error.contains(&to_parts.name));
    assert!(error.contains("; "));

    assert_eq!(
        executor.queried_labels().await,
        vec![to_customers.name.clone(), to_parts.name.clone()]
    );
}

#[tokio::test]
async fn test_dropping_the_run_aborts_units_in_flight() {
    let graph = ModelGraph::build(
        vec![Unit::new("slow_orders", UnitKind::Staging, "select 1 as id")],
        vec![Assertion::not_null("slow_orders", "id")],
    )
    .unwrap();
    let executor = MockExecutorBuilder::new().with_unit_latency("slow_orders", 200).build();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        run(&graph, Arc::new(executor.clone()), CancellationToken::new()),
    )
    .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(executor.materialized_units().await, vec!["slow_orders".to_string()]);
    assert!(executor.queried_labels().await.is_empty());
}

/// Panics while materializing one unit, succeeds for every other
struct PanickingExecutor {
    unit: &'static str,
}

#[async_trait::async_trait]
impl SqlExecutor for PanickingExecutor {
    fn name(&self) -> &'static str {
        "Panicking"
    }

    async fn materialize(&self, request: &MaterializeRequest, _target: &TargetConfig) -> Result<Relation, ExecutorError> {
        if request.unit == self.unit {
            panic!("executor bug while materializing {}", request.unit);
        }
        Ok(request.relation.clone())
    }

    async fn query(&self, _statement: &Statement, _target: &TargetConfig) -> Result<QueryOutcome, ExecutorError> {
        Ok(QueryOutcome::default())
    }
}

#[tokio::test]
async fn test_worker_panic_fails_unit_and_skips_descendants() {
    let graph = example_graph();
    let executor = PanickingExecutor { unit: "stg_lineitem" };

    let report = run_with_options(&graph, Arc::new(executor), CancellationToken::new(), options(2)).await;

    assert!(!report.cancelled);
    assert_eq!(report.status_of("stg_orders"), Some(UnitStatus::Succeeded));
    assert_eq!(report.status_of("stg_lineitem"), Some(UnitStatus::Failed));
    assert_eq!(report.unit("stg_lineitem").unwrap().error.as_deref(), Some("unit task panicked"));
    assert_eq!(report.status_of("int_order_items"), Some(UnitStatus::Skipped));
    assert_eq!(report.status_of("fct_orders"), Some(UnitStatus::Skipped));
    assert_eq!(report.summary.failed + report.summary.succeeded + report.summary.skipped, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_unit_runs_after_its_upstreams() {
    for size in [1usize, 5, 12, 30] {
        let dependencies: Vec<(String, Vec<String>)> = (0..size)
            .map(|i| {
                let upstream = (0..i)
                    .filter(|j| (i * 7 + j * 3) % 4 == 0)
                    .map(|j| format!("model_{}", j))
                    .collect();
                (format!("model_{}", i), upstream)
            })
            .collect();
        let graph = ModelGraph::from_dependencies(dependencies.clone()).unwrap();

        let executor = MockExecutorBuilder::new().with_latency(1).build();
        let report = run_with_options(&graph, Arc::new(executor.clone()), CancellationToken::new(), options(3)).await;
        assert!(report.is_success());

        let calls = executor.materialized_units().await;
        assert_eq!(calls.len(), size);
        let position = |name: &str| calls.iter().position(|c| c == name).unwrap();

        for (name, upstream) in &dependencies {
            for parent in upstream {
                assert!(position(parent) < position(name), "{parent} ran after {name}");
            }
        }
    }
}
