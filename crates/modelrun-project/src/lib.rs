//! modelrun project
//!
//! Loads a project directory into units and assertions, extracts
//! `ref()`/`source()` references from unit bodies, and builds the validated
//! model graph with its deterministic topological order.

pub mod refs;
pub mod graph;
pub mod project;

pub use refs::{extract_references, extract_upstream, parse_reference, source_unit_id, Reference};
pub use graph::{GraphError, ModelGraph};
pub use project::{Project, ProjectError, ProjectFile, PROJECT_FILE};
