//! Inventory watcher
//!
//! Periodically asks the inventory which clusters are due for reconciliation and
//! pushes them onto the bounded work queue consumed by the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::{ClusterState, Inventory};
use crate::error::{Error, Result};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CLUSTER_RECONCILE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Watcher settings; a zero duration selects the default, a negative one is rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InventoryWatchConfig {
    pub watch_interval: chrono::Duration,
    pub cluster_reconcile_interval: chrono::Duration,
}

impl Default for InventoryWatchConfig {
    fn default() -> Self {
        Self {
            watch_interval: chrono::Duration::zero(),
            cluster_reconcile_interval: chrono::Duration::zero(),
        }
    }
}

impl InventoryWatchConfig {
    pub fn new(watch_interval: Duration, cluster_reconcile_interval: Duration) -> Result<Self> {
        let convert = |d: Duration| {
            chrono::Duration::from_std(d)
                .map_err(|e| Error::ConfigError(format!("interval {d:?} out of range: {e}")))
        };
        Ok(Self {
            watch_interval: convert(watch_interval)?,
            cluster_reconcile_interval: convert(cluster_reconcile_interval)?,
        })
    }

    /// Validate and resolve to `(watch_interval, cluster_reconcile_interval)`
    pub fn resolve(&self) -> Result<(Duration, Duration)> {
        Ok((
            resolve_interval("watch interval", self.watch_interval, DEFAULT_WATCH_INTERVAL)?,
            resolve_interval(
                "cluster reconciliation interval",
                self.cluster_reconcile_interval,
                DEFAULT_CLUSTER_RECONCILE_INTERVAL,
            )?,
        ))
    }
}

fn resolve_interval(name: &str, value: chrono::Duration, default: Duration) -> Result<Duration> {
    if value < chrono::Duration::zero() {
        return Err(Error::ConfigError(format!("{name} cannot be < 0")));
    }
    if value.is_zero() {
        return Ok(default);
    }
    value
        .to_std()
        .map_err(|e| Error::ConfigError(format!("{name} out of range: {e}")))
}

pub struct InventoryWatcher {
    inventory: Arc<dyn Inventory>,
    watch_interval: Duration,
    cluster_reconcile_interval: Duration,
}

impl InventoryWatcher {
    pub fn new(inventory: Arc<dyn Inventory>, config: InventoryWatchConfig) -> Result<Self> {
        let (watch_interval, cluster_reconcile_interval) = config.resolve()?;
        Ok(Self {
            inventory,
            watch_interval,
            cluster_reconcile_interval,
        })
    }

    /// Run until `cancel` fires or the queue is closed.
    ///
    /// The first discovery pass happens immediately, then once per watch interval.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        queue: mpsc::Sender<ClusterState>,
    ) -> Result<()> {
        info!(
            "Watching cluster inventory every {:?} (reconcile interval {:?})",
            self.watch_interval, self.cluster_reconcile_interval
        );
        let mut ticker = tokio::time::interval(self.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stopping inventory watcher, cancellation requested");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if !self.process_clusters_to_reconcile(&cancel, &queue).await {
                return Ok(());
            }
        }
    }

    /// One discovery pass; returns false once the watcher should stop
    async fn process_clusters_to_reconcile(
        &self,
        cancel: &CancellationToken,
        queue: &mpsc::Sender<ClusterState>,
    ) -> bool {
        let states = match self
            .inventory
            .clusters_to_reconcile(self.cluster_reconcile_interval)
            .await
        {
            Ok(states) => states,
            Err(e) => {
                error!(
                    error_kind = e.metric_label(),
                    "Error while fetching clusters to reconcile from inventory (reconcile interval {:?}): {}",
                    self.cluster_reconcile_interval, e
                );
                #[cfg(feature = "metrics")]
                crate::metrics::inc_inventory_query_failures();
                return true;
            }
        };

        debug!(
            "Inventory watcher found {} cluster(s) which require a reconciliation",
            states.len()
        );
        for state in states {
            let cluster = state.cluster.clone();
            // a full queue blocks the pass; only shutdown interrupts it. Clusters not
            // pushed stay due in the inventory and are handed out on the next start.
            let sent = tokio::select! {
                biased;
                sent = queue.send(state) => sent,
                _ = cancel.cancelled() => {
                    debug!("Shutdown while waiting for queue capacity, dropping '{}'", cluster);
                    return false;
                }
            };
            if sent.is_err() {
                info!("Reconciliation queue closed, stopping inventory watcher");
                return false;
            }
            debug!("Added cluster '{}' to reconciliation queue", cluster);
            #[cfg(feature = "metrics")]
            crate::metrics::inc_clusters_enqueued();
        }
        true
    }
}
