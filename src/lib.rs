//! Tether - mutating admission webhook for Pod placement and sidecar injection
//!
//! Tether intercepts Pod creation and rewrites the Pod before it is persisted:
//!
//! - Pods annotated with `scheduledOrder` are bound to the first node with a
//!   free slot, after subtracting the slots used by their siblings
//!   (`workloadSelector`)
//! - Pods annotated with `sidecar.tether.dev/name: default` get a sidecar
//!   container, counted on a shared `Sidecar` custom resource
//!
//! Handlers keep no state between requests; everything shared lives in the
//! cluster.
//!
//! # Modules
//!
//! - [`webhook`] - Admission handlers, router and JSON Patch responses
//! - [`crd`] - The `Sidecar` Custom Resource Definition
//! - [`store`] - Cluster store traits and the Kubernetes-backed store
//! - [`template`] - Injection template sources and rendering
//! - [`retry`] - Bounded retry for conflicting writes
//! - [`error`] - Error types for store operations

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod store;
pub mod template;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default address of the HTTPS webhook server
///
/// Port 9443 is used instead of 443 to avoid requiring root privileges.
pub const DEFAULT_WEBHOOK_ADDR: &str = "0.0.0.0:9443";

/// Default number of attempts for a conflicting Sidecar update
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;
