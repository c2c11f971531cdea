//! Inventory double for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{ClusterModel, ClusterState, ClusterStatus, Inventory, MemoryInventory, StatusChange};
use crate::error::{Error, Result};

/// Delegates to a [`MemoryInventory`], counts queries and can fail discovery on demand
#[derive(Default)]
pub(crate) struct RecordingInventory {
    pub inner: MemoryInventory,
    pub discovery_calls: AtomicUsize,
    pub status_change_calls: AtomicUsize,
    failing_discoveries: AtomicUsize,
}

impl RecordingInventory {
    /// Make the next `n` discovery queries fail
    pub fn fail_discoveries(self, n: usize) -> Self {
        self.failing_discoveries.store(n, Ordering::SeqCst);
        self
    }

    pub fn discovery_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    pub fn status_change_calls(&self) -> usize {
        self.status_change_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inventory for RecordingInventory {
    async fn create_or_update(
        &self,
        contract_version: i64,
        model: &ClusterModel,
    ) -> Result<ClusterState> {
        self.inner.create_or_update(contract_version, model).await
    }

    async fn update_status(
        &self,
        state: &ClusterState,
        status: ClusterStatus,
    ) -> Result<ClusterState> {
        self.inner.update_status(state, status).await
    }

    async fn delete(&self, cluster: &str) -> Result<()> {
        self.inner.delete(cluster).await
    }

    async fn get(&self, cluster: &str, config_version: i64) -> Result<ClusterState> {
        self.inner.get(cluster, config_version).await
    }

    async fn get_latest(&self, cluster: &str) -> Result<ClusterState> {
        self.inner.get_latest(cluster).await
    }

    async fn status_changes(&self, cluster: &str, offset: Duration) -> Result<Vec<StatusChange>> {
        self.status_change_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.status_changes(cluster, offset).await
    }

    async fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> Result<Vec<ClusterState>> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_discoveries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_discoveries.store(failing - 1, Ordering::SeqCst);
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "inventory database unavailable",
            )));
        }
        self.inner.clusters_to_reconcile(reconcile_interval).await
    }
}
