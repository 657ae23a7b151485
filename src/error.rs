//! Error types for cluster store operations

use thiserror::Error;

/// Main error type for store operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A conditional write lost against a concurrent writer (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation error for annotations, selectors and record specs
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true if retrying the whole read-modify-write may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Map a kube error, turning 409 responses into [`Error::Conflict`]
    pub fn from_kube_write(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => Self::Conflict(resp.message.clone()),
            other => Self::Kube(other),
        }
    }
}
