//! Kubernetes access for the mothership
//!
//! [`KubernetesClient`] is the seam between the scheduling engine and a cluster's
//! API server. The progress tracker only needs `get`; `deploy` and `delete` exist for
//! callers applying component manifests.

mod client;
pub mod progress;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterState;
use crate::error::Result;

pub use client::{KubeClient, KubeconfigClientProvider};
pub use progress::{
    ProgressConfig, ProgressTracker, Readiness, ReadinessStrategy, TargetState, WatchableResource,
};

/// A Kubernetes object identified by kind, namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KubernetesResource [Kind:{},Namespace:{},Name:{}]",
            self.kind, self.namespace, self.name
        )
    }
}

#[async_trait]
pub trait KubernetesClient: Send + Sync {
    /// Fetch the live object; `Ok(None)` when the API server reports not found
    async fn get(
        &self,
        kind: WatchableResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Server-side apply every document of a multi-document YAML manifest.
    ///
    /// Not used by the scheduling loop; component reconcilers apply their own
    /// manifests through this and `delete`.
    async fn deploy(&self, manifest: &str) -> Result<Vec<Resource>>;

    /// Delete every object of a multi-document YAML manifest; missing objects are skipped
    async fn delete(&self, manifest: &str) -> Result<Vec<Resource>>;
}

/// Hands out a client for the cluster a reconciliation run targets
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for(&self, cluster: &ClusterState) -> Result<Arc<dyn KubernetesClient>>;
}
