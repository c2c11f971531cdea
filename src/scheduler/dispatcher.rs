//! Dispatcher
//!
//! Consumes the work queue filled by the inventory watcher and runs one scheduling
//! run per cluster: every component becomes an operation, is handed to its remote
//! reconciler, and the run waits for the callbacks. Once all operations succeeded,
//! the declared component resources are optionally verified with the progress
//! tracker before the cluster is marked ready.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::invoker::ComponentInvoker;
use super::operations::{OperationState, OperationsRegistry};
use crate::cluster::{ClusterState, ClusterStatus, Component, Inventory};
use crate::error::{ContextClosedReason, Error, Result};
use crate::kubernetes::{ClientProvider, ProgressConfig, ProgressTracker, TargetState, WatchableResource};
use crate::reconciler::ReconcileRequest;

const DEFAULT_WORKERS: usize = 10;
const DEFAULT_OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_CALLBACK_BASE_URL: &str = "http://localhost:8080";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of clusters reconciled concurrently
    pub workers: usize,
    pub operation_poll_interval: Duration,
    /// Upper bound for waiting on the callbacks of one scheduling run
    pub operation_timeout: Duration,
    /// Externally reachable base URL of the mothership
    pub callback_base_url: String,
    /// Convergence check settings; `None` trusts the reconciler callbacks alone
    pub progress: Option<ProgressConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            operation_poll_interval: DEFAULT_OPERATION_POLL_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            callback_base_url: DEFAULT_CALLBACK_BASE_URL.to_string(),
            progress: Some(ProgressConfig::default()),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be greater than zero".to_string()));
        }
        if self.operation_poll_interval.is_zero() || self.operation_timeout.is_zero() {
            return Err(Error::ConfigError(
                "operation poll interval and timeout must be greater than zero".to_string(),
            ));
        }
        if self.callback_base_url.trim().is_empty() {
            return Err(Error::ConfigError("callback base URL must not be empty".to_string()));
        }
        if let Some(progress) = &self.progress {
            progress.validate()?;
        }
        Ok(())
    }

    pub fn callback_url(&self, scheduling_id: &str, correlation_id: &str) -> String {
        format!(
            "{}/v1/operations/{}/callback/{}",
            self.callback_base_url.trim_end_matches('/'),
            scheduling_id,
            correlation_id
        )
    }
}

/// How a scheduling run ended
#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Converged,
    /// Retried on a later tick
    Failed(String),
    /// Cannot succeed without a configuration change
    Invalid(String),
    /// Shutdown interrupted the run
    Interrupted,
}

impl RunOutcome {
    fn status(&self) -> ClusterStatus {
        match self {
            RunOutcome::Converged => ClusterStatus::Ready,
            RunOutcome::Failed(_) => ClusterStatus::ReconcileFailed,
            RunOutcome::Invalid(_) => ClusterStatus::Error,
            RunOutcome::Interrupted => ClusterStatus::Pending,
        }
    }
}

/// A declared resource resolved to a watchable kind
type WatchTarget = (WatchableResource, String, String);

fn watch_targets(components: &[Component]) -> Result<Vec<WatchTarget>> {
    let mut targets = Vec::new();
    for component in components {
        for resource in &component.resources {
            let kind: WatchableResource = resource.kind.parse()?;
            let namespace = if resource.namespace.is_empty() {
                component.namespace.clone()
            } else {
                resource.namespace.clone()
            };
            targets.push((kind, namespace, resource.name.clone()));
        }
    }
    Ok(targets)
}

pub struct Dispatcher {
    inventory: Arc<dyn Inventory>,
    operations: Arc<dyn OperationsRegistry>,
    invoker: Arc<dyn ComponentInvoker>,
    clients: Option<Arc<dyn ClientProvider>>,
    config: DispatcherConfig,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases a cluster's in-flight slot when its run task ends, even on panic
struct InFlightGuard {
    dispatcher: Arc<Dispatcher>,
    cluster: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.dispatcher.release(&self.cluster);
    }
}

impl Dispatcher {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        operations: Arc<dyn OperationsRegistry>,
        invoker: Arc<dyn ComponentInvoker>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inventory,
            operations,
            invoker,
            clients: None,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Enable convergence verification against the clusters' API servers
    pub fn with_client_provider(mut self, clients: Arc<dyn ClientProvider>) -> Self {
        self.clients = Some(clients);
        self
    }

    fn claim(&self, cluster: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster.to_string())
    }

    fn release(&self, cluster: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cluster);
    }

    /// Consume the queue until `cancel` fires or every sender is gone, then wait for
    /// the runs still in progress.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut queue: mpsc::Receiver<ClusterState>,
    ) -> Result<()> {
        info!("Dispatcher started with {} worker(s)", self.config.workers);
        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Cluster reconciliation task failed: {}", e);
                }
            }

            // a free worker is required before taking work, so a busy dispatcher backs up the queue
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                state = queue.recv() => match state {
                    Some(state) => state,
                    None => {
                        info!("Reconciliation queue closed");
                        break;
                    }
                },
            };

            if !self.claim(&state.cluster) {
                debug!(
                    "Cluster '{}' is already being reconciled, skipping",
                    state.cluster
                );
                continue;
            }

            let guard = InFlightGuard {
                dispatcher: self.clone(),
                cluster: state.cluster.clone(),
            };
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let cluster = guard.cluster.clone();
                if let Err(e) = guard.dispatcher.reconcile_cluster(&cancel, state).await {
                    error!(
                        error_kind = e.metric_label(),
                        "Reconciliation of cluster '{}' failed: {}", cluster, e
                    );
                }
                drop(guard);
            });
        }

        info!(
            "Dispatcher stopping, waiting for {} running reconciliation(s)",
            tasks.len()
        );
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!("Cluster reconciliation task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Run one scheduling run for `state` and write the resulting cluster status.
    ///
    /// Returns the status written to the inventory, or `None` when `state` is no longer
    /// the latest status entry of its cluster and the run was skipped. Errors are
    /// limited to inventory access; everything else is expressed through the status.
    #[instrument(
        skip(self, cancel, state),
        fields(cluster = %state.cluster, config_version = state.config_version)
    )]
    pub async fn reconcile_cluster(
        &self,
        cancel: &CancellationToken,
        state: ClusterState,
    ) -> Result<Option<ClusterStatus>> {
        let Some(state) = self.current_snapshot(state).await? else {
            return Ok(None);
        };
        let started = Instant::now();
        let state = self
            .inventory
            .update_status(&state, ClusterStatus::Reconciling)
            .await?;
        let scheduling_id = Uuid::new_v4().to_string();
        info!("Reconciling {} (schedulingID {})", state, scheduling_id);

        let outcome = self.run_operations(cancel, &state, &scheduling_id).await;
        self.operations.remove_operations(&scheduling_id).await;

        let status = outcome.status();
        match &outcome {
            RunOutcome::Converged => info!("Cluster '{}' is ready", state.cluster),
            RunOutcome::Failed(reason) => {
                warn!("Reconciliation of '{}' failed: {}", state.cluster, reason)
            }
            RunOutcome::Invalid(reason) => error!(
                "Cluster '{}' cannot be reconciled: {}",
                state.cluster, reason
            ),
            RunOutcome::Interrupted => info!(
                "Reconciliation of '{}' interrupted by shutdown, resetting to {}",
                state.cluster, status
            ),
        }
        self.inventory.update_status(&state, status).await?;

        #[cfg(feature = "metrics")]
        crate::metrics::observe_cluster_reconciliation(
            status.as_str(),
            started.elapsed().as_secs_f64(),
        );
        debug!("Scheduling run {} took {:?}", scheduling_id, started.elapsed());
        Ok(Some(status))
    }

    /// Re-read the cluster and keep `queued` only while it is still the latest status
    /// entry. Queued snapshots go stale when a newer configuration arrives or an
    /// earlier copy of the same snapshot was already reconciled; the watcher hands
    /// the cluster out again if it is still due.
    async fn current_snapshot(&self, queued: ClusterState) -> Result<Option<ClusterState>> {
        let latest = match self.inventory.get_latest(&queued.cluster).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => {
                debug!("Cluster '{}' was deleted after it was queued", queued.cluster);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if latest.config_version != queued.config_version
            || latest.status != queued.status
            || latest.created != queued.created
        {
            debug!("Skipping stale snapshot {}, latest is {}", queued, latest);
            #[cfg(feature = "metrics")]
            crate::metrics::inc_stale_snapshots_skipped();
            return Ok(None);
        }
        Ok(Some(latest))
    }

    async fn run_operations(
        &self,
        cancel: &CancellationToken,
        state: &ClusterState,
        scheduling_id: &str,
    ) -> RunOutcome {
        if state.components.is_empty() {
            return RunOutcome::Converged;
        }
        // resolve kinds before dispatching anything so a bad declaration fails fast
        let targets = match watch_targets(&state.components) {
            Ok(targets) => targets,
            Err(e) => return RunOutcome::Invalid(e.to_string()),
        };

        for component in &state.components {
            let correlation_id = Uuid::new_v4().to_string();
            if let Err(e) = self
                .operations
                .register_operation(scheduling_id, &correlation_id, &state.cluster, &component.name)
                .await
            {
                return RunOutcome::Failed(e.to_string());
            }

            let request = ReconcileRequest {
                scheduling_id: scheduling_id.to_string(),
                correlation_id: correlation_id.clone(),
                cluster: state.cluster.clone(),
                component: component.name.clone(),
                namespace: component.namespace.clone(),
                version: component.version.clone(),
                configuration: component.configuration.clone(),
                kubeconfig: state.kubeconfig.clone(),
                callback_url: self.config.callback_url(scheduling_id, &correlation_id),
            };
            if let Err(e) = self.invoker.invoke(&request).await {
                warn!("Invoking reconciler of '{}' failed: {}", component.name, e);
                if let Err(e) = self
                    .operations
                    .set_error(&correlation_id, scheduling_id, &e.to_string())
                    .await
                {
                    warn!("Could not mark operation {} as failed: {}", correlation_id, e);
                }
            }
        }

        if let Err(outcome) = self.wait_for_operations(cancel, scheduling_id).await {
            return outcome;
        }
        self.verify_convergence(cancel, state, targets).await
    }

    /// Poll the registry until every operation of the run is terminal
    async fn wait_for_operations(
        &self,
        cancel: &CancellationToken,
        scheduling_id: &str,
    ) -> std::result::Result<(), RunOutcome> {
        let deadline = Instant::now() + self.config.operation_timeout;
        let mut ticker = tokio::time::interval(self.config.operation_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunOutcome::Interrupted),
                _ = sleep_until(deadline) => {
                    return Err(RunOutcome::Failed(format!(
                        "{} operation(s) did not finish within {:?}",
                        pending, self.config.operation_timeout
                    )));
                }
                _ = ticker.tick() => {}
            }

            let operations = self.operations.get_operations(scheduling_id).await;
            pending = operations
                .iter()
                .filter(|op| !op.state.is_terminal())
                .count();
            if pending > 0 {
                debug!(
                    "{} of {} operation(s) of run {} still pending",
                    pending,
                    operations.len(),
                    scheduling_id
                );
                continue;
            }

            let failed: Vec<String> = operations
                .iter()
                .filter(|op| op.state == OperationState::Error)
                .map(|op| {
                    format!(
                        "{}: {}",
                        op.component,
                        op.reason.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            if failed.is_empty() {
                return Ok(());
            }
            return Err(RunOutcome::Failed(format!(
                "component(s) failed: {}",
                failed.join("; ")
            )));
        }
    }

    async fn verify_convergence(
        &self,
        cancel: &CancellationToken,
        state: &ClusterState,
        targets: Vec<WatchTarget>,
    ) -> RunOutcome {
        let (Some(clients), Some(progress)) = (&self.clients, self.config.progress) else {
            return RunOutcome::Converged;
        };
        if targets.is_empty() {
            return RunOutcome::Converged;
        }

        let client = match clients.client_for(state).await {
            Ok(client) => client,
            Err(e) => return RunOutcome::Failed(format!("no client for cluster: {e}")),
        };
        let mut tracker = match ProgressTracker::new(client, progress) {
            Ok(tracker) => tracker,
            Err(e) => return RunOutcome::Failed(e.to_string()),
        };
        for (kind, namespace, name) in targets {
            tracker.add_resource(kind, namespace, name);
        }

        match tracker.watch(cancel, TargetState::Ready).await {
            Ok(()) => RunOutcome::Converged,
            Err(Error::ContextClosed(closed)) if closed.reason == ContextClosedReason::Cancelled => {
                RunOutcome::Interrupted
            }
            Err(e) => RunOutcome::Failed(e.to_string()),
        }
    }
}
