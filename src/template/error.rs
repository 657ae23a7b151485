//! Template error types

use std::fmt;

/// Errors that can occur while loading and rendering injection templates
#[derive(Debug)]
pub enum TemplateError {
    /// Template source could not provide the template
    Read {
        /// Template path relative to the source root
        path: String,
        /// Underlying failure
        message: String,
    },
    /// Template rendering failed
    Render(minijinja::Error),
    /// Template syntax configuration is invalid
    Syntax(String),
    /// Rendered template is not a valid Pod manifest
    Parse(String),
}

impl TemplateError {
    /// Create a read error for a template path
    pub fn read(path: &str, message: impl fmt::Display) -> Self {
        Self::Read {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, message } => {
                write!(f, "failed to read template {}: {}", path, message)
            }
            Self::Render(e) => write!(f, "template render error: {}", e),
            Self::Syntax(msg) => write!(f, "template syntax error: {}", msg),
            Self::Parse(msg) => write!(f, "rendered template is not a pod: {}", msg),
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        Self::Render(err)
    }
}
