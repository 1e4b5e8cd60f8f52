//! Jinja rendering of unit bodies
//!
//! This crate handles:
//! - Rendering `ref()`, `source()`, `var()`, `config()` and `this` against
//!   the relations upstream units materialized into
//! - Strict undefined handling so a missing variable fails the unit
//! - Mapping template errors to `RenderError`

pub mod context;
pub mod functions;
pub mod renderer;

pub use context::{RenderContext, TargetContext};
pub use functions::{config_function, ref_function, source_function, var_function};
pub use renderer::{RenderError, TemplateRenderer};
