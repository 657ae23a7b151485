//! Template sources
//!
//! Injection templates are addressed by a relative path such as
//! `sidecar/injection-template.yaml`. The binary ships them compiled in, and
//! an operator can point the webhook at a directory to override them.

use std::path::{Component, Path, PathBuf};

#[cfg(test)]
use mockall::automock;

use super::error::TemplateError;

/// Path of the default sidecar injection template
pub const SIDECAR_INJECTION_TEMPLATE: &str = "sidecar/injection-template.yaml";

const EMBEDDED: &[(&str, &str)] = &[(
    SIDECAR_INJECTION_TEMPLATE,
    include_str!("../../templates/sidecar/injection-template.yaml"),
)];

/// Provides template text by relative path
#[cfg_attr(test, automock)]
pub trait TemplateSource: Send + Sync {
    /// Read the template at `path`
    fn read_template(&self, path: &str) -> Result<String, TemplateError>;
}

/// Templates compiled into the binary
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbeddedTemplates;

impl TemplateSource for EmbeddedTemplates {
    fn read_template(&self, path: &str) -> Result<String, TemplateError> {
        EMBEDDED
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, content)| content.to_string())
            .ok_or_else(|| TemplateError::read(path, "no embedded template with this path"))
    }
}

/// Templates read from a directory on disk
#[derive(Clone, Debug)]
pub struct DirTemplates {
    root: PathBuf,
}

impl DirTemplates {
    /// Serve templates from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, TemplateError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || path.is_empty() {
            return Err(TemplateError::read(
                path,
                "template path must be relative and stay inside the template directory",
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl TemplateSource for DirTemplates {
    fn read_template(&self, path: &str) -> Result<String, TemplateError> {
        let full = self.resolve(path)?;
        std::fs::read_to_string(&full).map_err(|e| TemplateError::read(path, e))
    }
}
