//! Custom Resource Definitions owned by the webhook

mod sidecar;

pub use sidecar::{
    ServiceConfig, Sidecar, SidecarSpec, SidecarStatus, VolumeConfig, DEFAULT_SERVICE_SELECTOR,
    DEFAULT_SIDECAR_IMAGE,
};
