//! Body rendering
//!
//! Turns a unit body with Jinja expressions into executable SQL.

use minijinja::{Environment, Error as JinjaError, ErrorKind, UndefinedBehavior};
use std::path::{Path, PathBuf};

use crate::context::RenderContext;

/// Error during rendering
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("template error{}: {message}", location(.file_path, .line))]
    Template {
        message: String,
        file_path: Option<PathBuf>,
        line: Option<usize>,
    },

    #[error("undefined{}: {message}", location(.file_path, .line))]
    Undefined {
        message: String,
        file_path: Option<PathBuf>,
        line: Option<usize>,
    },
}

fn location(file_path: &Option<PathBuf>, line: &Option<usize>) -> String {
    match (file_path, line) {
        (Some(path), Some(line)) => format!(" in {}:{}", path.display(), line),
        (Some(path), None) => format!(" in {}", path.display()),
        (None, Some(line)) => format!(" on line {}", line),
        (None, None) => String::new(),
    }
}

/// Jinja renderer for unit bodies
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("ref", crate::functions::ref_function);
        env.add_function("source", crate::functions::source_function);
        env.add_function("var", crate::functions::var_function);
        env.add_function("config", crate::functions::config_function);

        env.add_filter("as_bool", |value: String| -> bool {
            matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
        });

        Self { env }
    }

    /// Check if a body contains Jinja syntax
    pub fn has_jinja(body: &str) -> bool {
        body.contains("{{") || body.contains("{%") || body.contains("{#")
    }

    /// Render a body
    pub fn render(
        &self,
        body: &str,
        context: &RenderContext,
        file_path: Option<&Path>,
    ) -> Result<String, RenderError> {
        if !Self::has_jinja(body) {
            return Ok(body.to_string());
        }

        self.env
            .render_str(body, context.to_minijinja_value())
            .map_err(|e| convert_error(e, file_path))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_error(error: JinjaError, file_path: Option<&Path>) -> RenderError {
    let file_path = file_path.map(Path::to_path_buf);
    let line = error.line();
    let message = match error.detail() {
        Some(detail) => detail.to_string(),
        None => error.kind().to_string(),
    };

    if error.kind() == ErrorKind::UndefinedError {
        RenderError::Undefined { message, file_path, line }
    } else {
        RenderError::Template { message, file_path, line }
    }
}
