//! Cluster inventory model
//!
//! A [`ClusterState`] is an immutable snapshot of one cluster at one configuration
//! version and one status entry. Updates never mutate a snapshot; they create a new
//! configuration version or a new status entry in the [`Inventory`].

mod inventory;
mod status;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kubernetes::Resource;

pub use inventory::{Clock, Inventory, MemoryInventory, StatusChange};
pub use status::{ClusterStatus, ExternalClusterStatus};

/// One configuration entry handed to a component reconciler
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub secret: bool,
}

/// A component installed on a managed cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub configuration: Vec<Configuration>,
    /// Resources whose readiness proves the component converged
    #[serde(default)]
    pub resources: Vec<Resource>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Desired state of a cluster as submitted by the inventory owner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModel {
    pub cluster: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl ClusterModel {
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.trim().is_empty() {
            return Err("cluster name must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(format!(
                    "cluster '{}' contains a component without name",
                    self.cluster
                ));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(format!(
                    "component '{}' is listed more than once",
                    component.name
                ));
            }
        }
        Ok(())
    }
}

/// Snapshot of a cluster at one configuration version and status entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub cluster: String,
    pub cluster_version: i64,
    pub config_version: i64,
    pub status: ClusterStatus,
    /// When this status entry was written
    pub created: DateTime<Utc>,
    pub components: Vec<Component>,
    #[serde(skip_serializing, default)]
    pub kubeconfig: Option<String>,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterState [Cluster={},ClusterVersion={},ConfigVersion={},Status={}]",
            self.cluster, self.cluster_version, self.config_version, self.status
        )
    }
}
