//! Compile without executing
//!
//! Renders every unit against the relations it would land in and compiles
//! every assertion, so the SQL a run would send can be inspected up front.

use modelrun_core::{AssertionKind, Relation, TargetConfig, UnitId};
use modelrun_project::ModelGraph;
use modelrun_template::{RenderContext, RenderError, TemplateRenderer};
use std::collections::BTreeMap;

use crate::test_gate::{compile, CompileError};

/// Compiled SQL for one unit
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub unit: UnitId,

    /// Relation the unit lands in
    pub relation: Relation,

    /// Rendered body; `None` for sources
    pub sql: Option<Result<String, RenderError>>,

    /// Compiled assertion queries by assertion name
    pub assertions: Vec<(String, Result<String, CompileError>)>,
}

/// Compile every unit in planned order
pub fn compile_graph(
    graph: &ModelGraph,
    target: &TargetConfig,
    vars: &BTreeMap<String, serde_json::Value>,
) -> Vec<CompiledUnit> {
    let renderer = TemplateRenderer::new();
    let relations: BTreeMap<UnitId, Relation> = graph
        .units()
        .iter()
        .map(|unit| (unit.name.clone(), target.relation_of(unit)))
        .collect();

    graph
        .order_indices()
        .iter()
        .map(|&index| {
            let unit = graph.unit_at(index);
            let relation = target.relation_of(unit);

            let sql = unit.effective_materialization().map(|_| {
                let upstream = unit
                    .upstream
                    .iter()
                    .filter_map(|id| relations.get_key_value(id));
                let context = RenderContext::new(target)
                    .with_this(&relation)
                    .with_relations(upstream)
                    .with_vars(vars);
                renderer.render(&unit.body, &context, unit.path.as_deref())
            });

            let assertions = graph
                .assertions_for(&unit.name)
                .into_iter()
                .map(|assertion| {
                    let target_relation = match &assertion.kind {
                        AssertionKind::Relationship { to, .. } => relations.get(to),
                        _ => None,
                    };
                    (assertion.name.clone(), compile(assertion, &relation, target_relation))
                })
                .collect();

            CompiledUnit {
                unit: unit.name.clone(),
                relation,
                sql,
                assertions,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrun_core::{Assertion, Unit, UnitKind};

    #[test]
    fn test_compiles_in_planned_order() {
        let graph = ModelGraph::build(
            vec![
                Unit::source("tpch.orders", Relation::new(None, "tpch_sf1", "orders")),
                Unit::new("fct_orders", UnitKind::Mart, "select * from {{ ref('stg_orders') }}")
                    .with_upstream(["stg_orders"]),
                Unit::new("stg_orders", UnitKind::Staging, "select * from {{ source('tpch', 'orders') }}")
                    .with_upstream(["tpch.orders"]),
            ],
            vec![Assertion::unique("fct_orders", "order_key")],
        )
        .unwrap();

        let compiled = compile_graph(&graph, &TargetConfig::default(), &BTreeMap::new());
        let names: Vec<&str> = compiled.iter().map(|c| c.unit.as_str()).collect();
        assert_eq!(names, vec!["tpch.orders", "stg_orders", "fct_orders"]);

        assert!(compiled[0].sql.is_none());
        assert_eq!(
            compiled[1].sql.clone().unwrap().unwrap(),
            "select * from tpch_sf1.orders"
        );
        assert_eq!(
            compiled[2].sql.clone().unwrap().unwrap(),
            "select * from public.stg_orders"
        );
        assert_eq!(compiled[2].assertions.len(), 1);
        assert!(compiled[2].assertions[0].1.is_ok());
    }
}
