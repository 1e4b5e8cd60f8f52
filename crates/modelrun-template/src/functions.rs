//! Template functions
//!
//! `ref()`, `source()` and `var()` read the resolution map and variables
//! from the render context, so one environment serves every unit.

use minijinja::value::Kwargs;
use minijinja::{Error, ErrorKind, State, Value};

use crate::context::{RELATIONS_KEY, VARS_KEY};

fn resolve(state: &State, unit: &str, call: &str) -> Result<Value, Error> {
    let relation = state
        .lookup(RELATIONS_KEY)
        .and_then(|relations| relations.get_attr(unit).ok())
        .filter(|value| !value.is_undefined() && !value.is_none());

    relation.ok_or_else(|| {
        Error::new(
            ErrorKind::UndefinedError,
            format!("{call} does not resolve to an upstream relation"),
        )
    })
}

/// `{{ ref('model') }}` or `{{ ref('package', 'model') }}`
pub fn ref_function(state: &State, first: String, second: Option<String>) -> Result<Value, Error> {
    let model = second.unwrap_or(first);
    resolve(state, &model, &format!("ref('{model}')"))
}

/// `{{ source('source_name', 'table_name') }}`
pub fn source_function(state: &State, source_name: String, table_name: String) -> Result<Value, Error> {
    let unit = format!("{}.{}", source_name, table_name);
    resolve(state, &unit, &format!("source('{source_name}', '{table_name}')"))
}

/// `{{ var('name') }}` or `{{ var('name', default) }}`
pub fn var_function(state: &State, name: String, default: Option<Value>) -> Result<Value, Error> {
    let value = state
        .lookup(VARS_KEY)
        .and_then(|vars| vars.get_attr(&name).ok())
        .filter(|value| !value.is_undefined());

    match (value, default) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Error::new(
            ErrorKind::UndefinedError,
            format!("required var '{name}' is not defined"),
        )),
    }
}

/// `{{ config(materialized='table') }}` renders to nothing
///
/// Configuration is read from schema files at load time.
pub fn config_function(kwargs: Kwargs) -> Result<Value, Error> {
    for key in kwargs.args() {
        let _: Value = kwargs.get(key)?;
    }
    Ok(Value::from(""))
}
