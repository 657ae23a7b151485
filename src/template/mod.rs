//! Sidecar injection templates
//!
//! An injection template is a Pod manifest with `${...}` placeholders bound to
//! a [`Sidecar`](crate::crd::Sidecar) record. Rendering it yields a template
//! Pod holding exactly the sidecar containers and volumes to merge into the
//! admitted Pod.
//!
//! - [`TemplateSource`] provides template text ([`EmbeddedTemplates`],
//!   [`DirTemplates`])
//! - [`TemplateEngine`] renders it with minijinja, strict about undefined
//!   variables

mod engine;
mod error;
mod source;

pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use source::{DirTemplates, EmbeddedTemplates, TemplateSource, SIDECAR_INJECTION_TEMPLATE};

#[cfg(test)]
pub use source::MockTemplateSource;
