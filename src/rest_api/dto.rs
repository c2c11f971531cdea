//! Data transfer objects for the REST API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterState, ExternalClusterStatus, StatusChange};

/// Cluster as reported to the inventory owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub cluster: String,
    pub cluster_version: i64,
    pub configuration_version: i64,
    pub status: ExternalClusterStatus,
    #[serde(rename = "statusURL")]
    pub status_url: String,
}

impl ClusterResponse {
    /// `base` is scheme and host the client used to reach the mothership
    pub fn new(state: &ClusterState, base: &str, contract_version: i64) -> Self {
        Self {
            cluster: state.cluster.clone(),
            cluster_version: state.cluster_version,
            configuration_version: state.config_version,
            status: state.status.external(),
            status_url: format!(
                "{}/v{}/clusters/{}/configs/{}/status",
                base.trim_end_matches('/'),
                contract_version,
                state.cluster,
                state.config_version
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeResponse {
    pub status: ExternalClusterStatus,
    pub started: DateTime<Utc>,
    /// Human readable, e.g. `1h 12m 3s`
    pub duration: String,
}

impl From<&StatusChange> for StatusChangeResponse {
    fn from(change: &StatusChange) -> Self {
        Self {
            status: change.status.external(),
            started: change.started,
            duration: humantime::format_duration(change.duration).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangesResponse {
    pub status_changes: Vec<StatusChangeResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusChangesQuery {
    pub offset: Option<String>,
}

/// Acknowledgement of an accepted callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    #[serde(rename = "schedulingID")]
    pub scheduling_id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
