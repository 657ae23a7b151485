//! Mutating Admission Webhook for Pods
//!
//! Two independent mutations, each on its own path:
//! - [`scheduling`]: bind a Pod to the first node with spare capacity in its
//!   `scheduledOrder` annotation
//! - [`sidecar`]: inject the default sidecar and count it on the shared
//!   [`Sidecar`](crate::crd::Sidecar) record
//!
//! Both hand the mutated Pod to [`patch`], which diffs it against the
//! original object and returns a JSON Patch.

pub mod patch;
pub mod scheduling;
pub mod sidecar;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse},
    Client,
};
use serde_json::Value;

use crate::retry::RetryConfig;
use crate::store::{KubeStore, PodStore, SidecarStore};
use crate::template::{TemplateEngine, TemplateError, TemplateSource};

/// Path of the node placement webhook
pub const SCHEDULING_PATH: &str = "/mutate-v1-pod-scheduling";

/// Path of the sidecar injection webhook
pub const SIDECAR_PATH: &str = "/mutate-v1-pod-sidecar";

/// Shared state for webhook handlers
///
/// Built once at startup and shared read-only by every request.
pub struct WebhookState {
    /// Sibling Pod lookups for placement
    pub pods: Arc<dyn PodStore>,
    /// Sidecar record access for injection
    pub sidecars: Arc<dyn SidecarStore>,
    /// Source of the injection template
    pub templates: Arc<dyn TemplateSource>,
    /// Renderer for the injection template
    pub engine: TemplateEngine,
    /// Retry policy for conflicting Sidecar writes
    pub retry: RetryConfig,
}

impl WebhookState {
    /// Create webhook state from explicit collaborators
    pub fn new(
        pods: Arc<dyn PodStore>,
        sidecars: Arc<dyn SidecarStore>,
        templates: Arc<dyn TemplateSource>,
        engine: TemplateEngine,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pods,
            sidecars,
            templates,
            engine,
            retry,
        }
    }

    /// Create webhook state backed by the Kubernetes API server
    pub fn with_client(
        kube: Client,
        templates: Arc<dyn TemplateSource>,
        retry: RetryConfig,
    ) -> Result<Self, TemplateError> {
        let store = Arc::new(KubeStore::new(kube));
        Ok(Self::new(
            store.clone(),
            store,
            templates,
            TemplateEngine::new()?,
            retry,
        ))
    }
}

/// Create the webhook router with all mutation endpoints
///
/// - POST /mutate-v1-pod-scheduling - assign `spec.nodeName`
/// - POST /mutate-v1-pod-sidecar - inject the default sidecar
/// - GET /healthz - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(SCHEDULING_PATH, post(scheduling::mutate_handler))
        .route(SIDECAR_PATH, post(sidecar::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Error type for webhook operations
///
/// Every variant rejects the admission request; the Pod is never
/// partially mutated.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admitted object is not a decodable Pod
    #[error("invalid pod: {0}")]
    Decode(String),

    /// The Pod lacks what the mutation needs (e.g. a usable label)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A cluster store call failed
    #[error("store error: {0}")]
    Store(#[from] crate::Error),

    /// The injection template could not be read, rendered or parsed
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// The mutated Pod or its patch could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WebhookError {
    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// HTTP status reported in the rejected admission response
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Precondition(_)
            | Self::Store(_)
            | Self::Template(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reject the request, carrying the status code and message
    pub fn into_admission_response(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        let code = self.status_code().as_u16();
        let mut response = AdmissionResponse::from(request).deny(self.to_string());
        response.result.code = code;
        response
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Decode the admitted object into a Pod
///
/// Returns the object as submitted alongside the typed Pod, or `None` when
/// the request carries no object.
pub(crate) fn decode_pod(
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<(Value, Pod)>, WebhookError> {
    let Some(object) = &request.object else {
        return Ok(None);
    };
    let original =
        serde_json::to_value(object).map_err(|e| WebhookError::Decode(e.to_string()))?;
    let pod = serde_json::from_value(original.clone())
        .map_err(|e| WebhookError::Decode(e.to_string()))?;
    Ok(Some((original, pod)))
}
