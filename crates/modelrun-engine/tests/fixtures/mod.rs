//! Test fixtures for engine integration tests
//!
//! Graphs modelled on the TPC-H demo project: two staging models over the
//! raw orders and line items, an intermediate join, and an order fact.

#![allow(dead_code)]

use modelrun_core::{Assertion, Relation, Severity, Unit, UnitKind};
use modelrun_project::ModelGraph;

/// stg_orders, stg_lineitem -> int_order_items -> fct_orders
///
/// Staging models read raw tables directly, so the graph has no sources.
pub fn example_graph() -> ModelGraph {
    ModelGraph::build(example_units(), Vec::new()).unwrap()
}

pub fn example_units() -> Vec<Unit> {
    vec![
        Unit::new(
            "stg_orders",
            UnitKind::Staging,
            "select o_orderkey as order_key, o_orderstatus as status_code from raw.orders",
        ),
        Unit::new(
            "stg_lineitem",
            UnitKind::Staging,
            "select l_orderkey as order_key, l_linenumber as line_number from raw.lineitem",
        ),
        Unit::new(
            "int_order_items",
            UnitKind::Mart,
            "select o.order_key, l.line_number\n\
             from {{ ref('stg_orders') }} o\n\
             join {{ ref('stg_lineitem') }} l on o.order_key = l.order_key",
        )
        .with_upstream(["stg_orders", "stg_lineitem"]),
        Unit::new(
            "fct_orders",
            UnitKind::Mart,
            "select order_key, count(*) as items from {{ ref('int_order_items') }} group by 1",
        )
        .with_upstream(["int_order_items"]),
    ]
}

/// The example graph with sources and a realistic set of assertions
pub fn tpch_graph() -> ModelGraph {
    let mut units = vec![
        Unit::source("tpch.orders", Relation::new(Some("snowflake_sample_data".into()), "tpch_sf1", "orders")),
        Unit::source("tpch.lineitem", Relation::new(Some("snowflake_sample_data".into()), "tpch_sf1", "lineitem")),
    ];

    for unit in example_units() {
        let unit = match unit.name.as_str() {
            "stg_orders" => unit
                .with_upstream(["tpch.orders"])
                .with_body("select o_orderkey as order_key, o_orderstatus as status_code from {{ source('tpch', 'orders') }}"),
            "stg_lineitem" => unit
                .with_upstream(["tpch.lineitem"])
                .with_body("select l_orderkey as order_key, l_linenumber as line_number from {{ source('tpch', 'lineitem') }}"),
            _ => unit,
        };
        units.push(unit);
    }

    ModelGraph::build(units, tpch_assertions()).unwrap()
}

pub fn tpch_assertions() -> Vec<Assertion> {
    vec![
        Assertion::unique("tpch.orders", "o_orderkey"),
        Assertion::unique("stg_orders", "order_key"),
        Assertion::not_null("stg_orders", "order_key"),
        Assertion::accepted_values("stg_orders", "status_code", ["F", "O", "P"]).with_severity(Severity::Warn),
        Assertion::not_null("stg_lineitem", "order_key"),
        Assertion::relationship("int_order_items", "order_key", "stg_orders", "order_key"),
        Assertion::unique("fct_orders", "order_key"),
        Assertion::custom("fct_orders", "items > 0"),
    ]
}

/// Name of the generated `unique` assertion on a column
pub fn unique_name(unit: &str, column: &str) -> String {
    Assertion::unique(unit, column).name
}

/// Name of the generated `not_null` assertion on a column
pub fn not_null_name(unit: &str, column: &str) -> String {
    Assertion::not_null(unit, column).name
}
