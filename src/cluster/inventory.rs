//! Cluster inventory
//!
//! The [`Inventory`] trait is the boundary to the authoritative store of managed
//! clusters. [`MemoryInventory`] keeps everything in process memory and is used by
//! the mothership when no durable store is wired in, and by the tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClusterModel, ClusterState, ClusterStatus, Component};
use crate::error::{Error, Result};

/// Source of "now" for status timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// One entry of a cluster's status history
#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub config_version: i64,
    pub status: ClusterStatus,
    pub started: DateTime<Utc>,
    /// Time until the next status entry (or until now for the latest one)
    pub duration: Duration,
}

#[async_trait]
pub trait Inventory: Send + Sync {
    /// Register a cluster or store a new configuration version for it
    async fn create_or_update(
        &self,
        contract_version: i64,
        model: &ClusterModel,
    ) -> Result<ClusterState>;

    /// Append a status entry for the configuration version of `state`
    async fn update_status(&self, state: &ClusterState, status: ClusterStatus)
        -> Result<ClusterState>;

    async fn delete(&self, cluster: &str) -> Result<()>;

    async fn get(&self, cluster: &str, config_version: i64) -> Result<ClusterState>;

    async fn get_latest(&self, cluster: &str) -> Result<ClusterState>;

    /// Status history of a cluster within `offset` of now, ordered by occurrence
    async fn status_changes(&self, cluster: &str, offset: Duration) -> Result<Vec<StatusChange>>;

    /// Clusters that are pending, failed, or were last reconciled longer than
    /// `reconcile_interval` ago
    async fn clusters_to_reconcile(&self, reconcile_interval: Duration)
        -> Result<Vec<ClusterState>>;
}

#[derive(Clone, Debug)]
struct StatusEntry {
    status: ClusterStatus,
    created: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct ConfigEntry {
    cluster_version: i64,
    config_version: i64,
    kubeconfig: Option<String>,
    metadata: std::collections::BTreeMap<String, String>,
    components: Vec<Component>,
    statuses: Vec<StatusEntry>,
}

impl ConfigEntry {
    fn latest_status(&self) -> Option<&StatusEntry> {
        self.statuses.last()
    }

    fn state(&self, cluster: &str, entry: &StatusEntry) -> ClusterState {
        ClusterState {
            cluster: cluster.to_string(),
            cluster_version: self.cluster_version,
            config_version: self.config_version,
            status: entry.status,
            created: entry.created,
            components: self.components.clone(),
            kubeconfig: self.kubeconfig.clone(),
        }
    }

    fn latest_state(&self, cluster: &str) -> Option<ClusterState> {
        self.latest_status().map(|entry| self.state(cluster, entry))
    }
}

/// In-memory inventory; configuration versions per cluster are kept in ascending order
pub struct MemoryInventory {
    clusters: RwLock<HashMap<String, Vec<ConfigEntry>>>,
    clock: Clock,
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

fn not_found(cluster: &str) -> Error {
    Error::NotFound(format!("Cluster '{cluster}'"))
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::ValidationError(format!("duration {duration:?} out of range: {e}")))
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn create_or_update(
        &self,
        contract_version: i64,
        model: &ClusterModel,
    ) -> Result<ClusterState> {
        if contract_version < 1 {
            return Err(Error::ValidationError(format!(
                "contract version {contract_version} is not supported"
            )));
        }
        model.validate().map_err(Error::ValidationError)?;

        let now = self.now();
        let mut clusters = self.clusters.write().await;
        let configs = clusters.entry(model.cluster.clone()).or_default();

        let (cluster_version, config_version) = match configs.last() {
            Some(latest) => {
                let cluster_changed =
                    latest.kubeconfig != model.kubeconfig || latest.metadata != model.metadata;
                let config_changed = latest.components != model.components;
                if !cluster_changed && !config_changed {
                    debug!(
                        "Cluster '{}' unchanged, keeping config version {}",
                        model.cluster, latest.config_version
                    );
                    return latest
                        .latest_state(&model.cluster)
                        .ok_or_else(|| not_found(&model.cluster));
                }
                (
                    latest.cluster_version + i64::from(cluster_changed),
                    latest.config_version + 1,
                )
            }
            None => (1, 1),
        };

        let entry = ConfigEntry {
            cluster_version,
            config_version,
            kubeconfig: model.kubeconfig.clone(),
            metadata: model.metadata.clone(),
            components: model.components.clone(),
            statuses: vec![StatusEntry {
                status: ClusterStatus::Pending,
                created: now,
            }],
        };
        debug!(
            "Stored cluster '{}' (contract v{}) with cluster version {} and config version {}",
            model.cluster, contract_version, cluster_version, config_version
        );
        let state = entry
            .latest_state(&model.cluster)
            .ok_or_else(|| not_found(&model.cluster))?;
        configs.push(entry);
        Ok(state)
    }

    async fn update_status(
        &self,
        state: &ClusterState,
        status: ClusterStatus,
    ) -> Result<ClusterState> {
        let now = self.now();
        let mut clusters = self.clusters.write().await;
        let entry = clusters
            .get_mut(&state.cluster)
            .and_then(|configs| {
                configs
                    .iter_mut()
                    .find(|c| c.config_version == state.config_version)
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Cluster '{}' with config version {}",
                    state.cluster, state.config_version
                ))
            })?;

        if let Some(latest) = entry.latest_status() {
            if latest.status == status {
                return Ok(entry.state(&state.cluster, latest));
            }
        }
        entry.statuses.push(StatusEntry {
            status,
            created: now,
        });
        entry
            .latest_state(&state.cluster)
            .ok_or_else(|| not_found(&state.cluster))
    }

    async fn delete(&self, cluster: &str) -> Result<()> {
        self.clusters
            .write()
            .await
            .remove(cluster)
            .map(|_| ())
            .ok_or_else(|| not_found(cluster))
    }

    async fn get(&self, cluster: &str, config_version: i64) -> Result<ClusterState> {
        let clusters = self.clusters.read().await;
        clusters
            .get(cluster)
            .and_then(|configs| configs.iter().find(|c| c.config_version == config_version))
            .and_then(|entry| entry.latest_state(cluster))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Cluster '{cluster}' with config version {config_version}"
                ))
            })
    }

    async fn get_latest(&self, cluster: &str) -> Result<ClusterState> {
        let clusters = self.clusters.read().await;
        clusters
            .get(cluster)
            .and_then(|configs| configs.last())
            .and_then(|entry| entry.latest_state(cluster))
            .ok_or_else(|| not_found(cluster))
    }

    async fn status_changes(&self, cluster: &str, offset: Duration) -> Result<Vec<StatusChange>> {
        let now = self.now();
        let since = now - to_chrono(offset)?;
        let clusters = self.clusters.read().await;
        let configs = clusters.get(cluster).ok_or_else(|| not_found(cluster))?;

        let mut entries: Vec<(i64, &StatusEntry)> = configs
            .iter()
            .flat_map(|c| c.statuses.iter().map(move |s| (c.config_version, s)))
            .collect();
        entries.sort_by_key(|(_, s)| s.created);

        let mut changes = Vec::with_capacity(entries.len());
        for (idx, (config_version, entry)) in entries.iter().enumerate() {
            let ended = entries
                .get(idx + 1)
                .map(|(_, next)| next.created)
                .unwrap_or(now);
            if ended < since {
                continue;
            }
            changes.push(StatusChange {
                config_version: *config_version,
                status: entry.status,
                started: entry.created,
                duration: (ended - entry.created).to_std().unwrap_or_default(),
            });
        }
        Ok(changes)
    }

    async fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> Result<Vec<ClusterState>> {
        let threshold = self.now() - to_chrono(reconcile_interval)?;
        let clusters = self.clusters.read().await;

        let mut due: Vec<ClusterState> = clusters
            .iter()
            .filter_map(|(name, configs)| configs.last().and_then(|c| c.latest_state(name)))
            .filter(|state| {
                state.status.needs_reconciliation()
                    || (state.status == ClusterStatus::Ready && state.created <= threshold)
            })
            .collect();
        due.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        Ok(due)
    }
}
