//! Template engine for injection templates
//!
//! Uses minijinja with custom syntax configuration:
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//! - Escape: `$${...}` produces literal `${...}`, for shell snippets

use k8s_openapi::api::core::v1::Pod;
use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior, Value};

use super::error::TemplateError;
use crate::crd::Sidecar;

/// Placeholder for escaped `$${` during preprocessing
const ESCAPED_PLACEHOLDER: &str = "\x00__TETHER_ESCAPED_DOLLAR_BRACE__\x00";

/// Renders injection templates against a [`Sidecar`] record
///
/// The template sees:
/// - `name`, `namespace` of the record
/// - `spec` with the record spec in its serialized (camelCase) form
/// - `metadata` with the full record metadata
///
/// Undefined variables are errors.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

impl TemplateEngine {
    /// Create a new template engine
    pub fn new() -> Result<Self, TemplateError> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| TemplateError::Syntax(e.to_string()))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);

        Ok(Self { env })
    }

    /// Render a template string against a Sidecar record
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if the template syntax is invalid or a
    /// referenced variable is undefined.
    pub fn render(&self, template: &str, sidecar: &Sidecar) -> Result<String, TemplateError> {
        let preprocessed = template.replace("$${", ESCAPED_PLACEHOLDER);

        let ctx = minijinja::context! {
            name => sidecar.metadata.name.clone().unwrap_or_default(),
            namespace => sidecar.metadata.namespace.clone().unwrap_or_default(),
            metadata => Value::from_serialize(&sidecar.metadata),
            spec => Value::from_serialize(&sidecar.spec),
        };

        let rendered = self.env.render_str(&preprocessed, ctx)?;

        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }

    /// Render a template and parse the result as the template Pod
    ///
    /// The template Pod carries exactly the sidecar containers and volumes
    /// to merge into the admitted Pod.
    pub fn render_pod(&self, template: &str, sidecar: &Sidecar) -> Result<Pod, TemplateError> {
        let rendered = self.render(template, sidecar)?;
        serde_yaml::from_str(&rendered).map_err(|e| TemplateError::Parse(e.to_string()))
    }
}
