//! Sidecar Custom Resource Definition
//!
//! A Sidecar record tracks the shared sidecar deployment for every Pod that
//! matches its `selector`. The admission webhook creates it on the first
//! injection and bumps `replicas` on each one after that.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default image for the injected sidecar container
pub const DEFAULT_SIDECAR_IMAGE: &str = "ghcr.io/tether-dev/sidecar:latest";

/// Default service selector attached to governed Pods
pub const DEFAULT_SERVICE_SELECTOR: &str = "rpc.tether.dev/rpc=sidecar-rpc";

/// Specification for a Sidecar
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tether.dev",
    version = "v1alpha1",
    kind = "Sidecar",
    plural = "sidecars",
    shortname = "sc",
    status = "SidecarStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Selector","type":"string","jsonPath":".spec.selector"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    /// Number of Pods injected against this record
    #[serde(default)]
    pub replicas: i32,

    /// Governing label selector, `key=value`
    pub selector: String,

    /// Sidecar container image
    #[serde(default = "default_image")]
    pub image: String,

    /// Shared memory size handed to the sidecar process
    #[serde(default = "default_size")]
    pub size: String,

    /// Socket volume configuration
    #[serde(default)]
    pub volume: VolumeConfig,

    /// RPC service configuration
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_image() -> String {
    DEFAULT_SIDECAR_IMAGE.to_string()
}

fn default_size() -> String {
    "256Mi".to_string()
}

impl SidecarSpec {
    /// Spec for a freshly created default record governing `key=value`
    pub fn default_for(selector: impl Into<String>) -> Self {
        Self {
            replicas: 1,
            selector: selector.into(),
            image: default_image(),
            size: default_size(),
            volume: VolumeConfig::default(),
            service: ServiceConfig::default(),
        }
    }

    /// Returns true if the socket lives on a persistent volume claim
    pub fn uses_pvc(&self) -> bool {
        !self.volume.pvc_name.is_empty()
    }
}

/// Where the sidecar socket is shared with application containers
///
/// An empty `pvc_name` means an ephemeral per-node volume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Name of the persistent volume claim, empty for an emptyDir volume
    #[serde(default)]
    pub pvc_name: String,

    /// Mount path of the claim inside application containers
    #[serde(default)]
    pub mount_path: String,
}

/// RPC service exposing the sidecars
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Kubernetes service type
    #[serde(rename = "type", default = "default_service_type")]
    pub type_: String,

    /// RPC port
    #[serde(default = "default_service_port")]
    pub port: i32,

    /// Label `key=value` added to every governed Pod
    #[serde(default = "default_service_selector")]
    pub selector: String,
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

fn default_service_port() -> i32 {
    9600
}

fn default_service_selector() -> String {
    DEFAULT_SERVICE_SELECTOR.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            type_: default_service_type(),
            port: default_service_port(),
            selector: default_service_selector(),
        }
    }
}

/// Status for a Sidecar, owned by the sidecar controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarStatus {
    /// Number of running sidecars
    #[serde(default)]
    pub current: i32,
}
