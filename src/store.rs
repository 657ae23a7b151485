//! Cluster store access for the admission handlers
//!
//! The handlers only need a handful of calls against the API server: list
//! sibling Pods by label, and get/create/replace a [`Sidecar`] record. They
//! are expressed as traits so the handlers can be exercised against mocks
//! and in-memory stores, with [`KubeStore`] as the production implementation.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::Sidecar;
use crate::Error;

/// An equality label selector, `key=value`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    /// Label key
    pub key: String,
    /// Label value
    pub value: String,
}

impl LabelSelector {
    /// Create a selector from a key and value
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            }
            _ => Err(Error::validation(format!(
                "label selector {s:?} is not of the form key=value"
            ))),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Read access to workload Pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodStore: Send + Sync {
    /// List Pods in every namespace matching the selector
    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, Error>;
}

/// Read/write access to Sidecar records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SidecarStore: Send + Sync {
    /// Fetch a Sidecar, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Sidecar>, Error>;

    /// Create a Sidecar
    ///
    /// Returns [`Error::Conflict`] if it already exists.
    async fn create(&self, sidecar: &Sidecar) -> Result<Sidecar, Error>;

    /// Replace a Sidecar, conditional on its `metadata.resourceVersion`
    ///
    /// Returns [`Error::Conflict`] if the record changed since it was read.
    async fn replace(&self, sidecar: &Sidecar) -> Result<Sidecar, Error>;
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn sidecars(&self, sidecar: &Sidecar) -> Result<(Api<Sidecar>, String), Error> {
        let name = sidecar
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("sidecar record has no name"))?;
        let namespace = sidecar
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation(format!("sidecar record {name} has no namespace")))?;
        Ok((Api::namespaced(self.client.clone(), namespace), name))
    }
}

#[async_trait]
impl PodStore for KubeStore {
    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&selector.to_string());
        Ok(api.list(&params).await?.items)
    }
}

#[async_trait]
impl SidecarStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Sidecar>, Error> {
        let api: Api<Sidecar> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, sidecar: &Sidecar) -> Result<Sidecar, Error> {
        let (api, _) = self.sidecars(sidecar)?;
        api.create(&PostParams::default(), sidecar)
            .await
            .map_err(Error::from_kube_write)
    }

    async fn replace(&self, sidecar: &Sidecar) -> Result<Sidecar, Error> {
        let (api, name) = self.sidecars(sidecar)?;
        api.replace(&name, &PostParams::default(), sidecar)
            .await
            .map_err(Error::from_kube_write)
    }
}
