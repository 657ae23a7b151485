//! Mutation responses
//!
//! Turns a mutated Pod into an admission response carrying the JSON Patch
//! (RFC 6902) from the object as submitted to the mutated Pod.

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse},
};
use serde_json::Value;

use super::WebhookError;

/// Diff the submitted object against the serialized mutated Pod
pub fn build_patch(original: &Value, mutated: &Pod) -> Result<json_patch::Patch, WebhookError> {
    let mutated = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(original, &mutated))
}

/// Allow the request with the patch transforming `original` into `mutated`
///
/// An empty diff allows the request without a patch.
pub fn patch_response(
    request: &AdmissionRequest<DynamicObject>,
    original: &Value,
    mutated: &Pod,
) -> Result<AdmissionResponse, WebhookError> {
    let patch = build_patch(original, mutated)?;
    let response = AdmissionResponse::from(request);
    if patch.0.is_empty() {
        return Ok(response);
    }
    response
        .with_patch(patch)
        .map_err(|e| WebhookError::Serialization(format!("patch serialization error: {e}")))
}
