//! Polls a fixed set of resources until they reach a target state

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::readiness::{Readiness, WatchableResource};
use crate::error::{ContextClosedError, ContextClosedReason, Error, Result};
use crate::kubernetes::KubernetesClient;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// State every target has to reach before a watch succeeds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Ready,
    /// The object is gone (or reports a terminal end state)
    Terminated,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Ready => write!(f, "ready"),
            TargetState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressConfig {
    /// Pause between two polls of the pending targets
    pub interval: Duration,
    /// Upper bound for one watch
    pub timeout: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::ConfigError(
                "progress interval must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::ConfigError(
                "progress timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Target {
    kind: WatchableResource,
    namespace: String,
    name: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// One polling session over a set of resources
pub struct ProgressTracker {
    client: Arc<dyn KubernetesClient>,
    config: ProgressConfig,
    targets: Vec<Target>,
}

impl ProgressTracker {
    pub fn new(client: Arc<dyn KubernetesClient>, config: ProgressConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            targets: Vec::new(),
        })
    }

    pub fn add_resource(
        &mut self,
        kind: WatchableResource,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) {
        let target = Target {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        };
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
    }

    /// Register a target by its kind name; kinds without a readiness strategy are rejected
    pub fn add_resource_by_kind(&mut self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let kind: WatchableResource = kind.parse()?;
        self.add_resource(kind, namespace, name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Block until every target reached `target_state`.
    ///
    /// Fails with [`Error::ContextClosed`] when the timeout elapses or `cancel` fires
    /// first. The first poll happens immediately.
    pub async fn watch(&self, cancel: &CancellationToken, target_state: TargetState) -> Result<()> {
        if self.targets.is_empty() {
            return Ok(());
        }

        info!(
            "Watching {} resource(s) until {} (interval {:?}, timeout {:?})",
            self.targets.len(),
            target_state,
            self.config.interval,
            self.config.timeout
        );

        let deadline = Instant::now() + self.config.timeout;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Vec<&Target> = self.targets.iter().collect();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(closed(ContextClosedReason::Cancelled, &pending));
                }
                _ = sleep_until(deadline) => {
                    return Err(closed(ContextClosedReason::DeadlineExceeded, &pending));
                }
                _ = ticker.tick() => {}
            }

            let checks = pending
                .iter()
                .map(|target| self.is_satisfied(target, target_state));
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(closed(ContextClosedReason::Cancelled, &pending));
                }
                _ = sleep_until(deadline) => {
                    return Err(closed(ContextClosedReason::DeadlineExceeded, &pending));
                }
                results = join_all(checks) => results,
            };

            pending = pending
                .into_iter()
                .zip(results)
                .filter_map(|(target, satisfied)| (!satisfied).then_some(target))
                .collect();

            if pending.is_empty() {
                info!(
                    "All {} resource(s) reached state {}",
                    self.targets.len(),
                    target_state
                );
                #[cfg(feature = "metrics")]
                crate::metrics::inc_progress_watch("converged");
                return Ok(());
            }
            debug!(
                "{} of {} resource(s) not yet {}",
                pending.len(),
                self.targets.len(),
                target_state
            );
        }
    }

    async fn is_satisfied(&self, target: &Target, target_state: TargetState) -> bool {
        match self
            .client
            .get(target.kind, &target.namespace, &target.name)
            .await
        {
            Ok(None) => {
                debug!("{} not found", target);
                target_state == TargetState::Terminated
            }
            Ok(Some(obj)) => match target.kind.classify(&obj) {
                Ok(readiness) => matches!(
                    (target_state, readiness),
                    (TargetState::Ready, Readiness::Ready)
                        | (TargetState::Terminated, Readiness::Terminated)
                ),
                Err(e) => {
                    warn!("Could not classify {}: {}", target, e);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to fetch {}: {}", target, e);
                false
            }
        }
    }
}

fn closed(reason: ContextClosedReason, pending: &[&Target]) -> Error {
    warn!(
        "Stopped watching with {} resource(s) pending: {}",
        pending.len(),
        reason
    );
    #[cfg(feature = "metrics")]
    crate::metrics::inc_progress_watch(match reason {
        ContextClosedReason::Cancelled => "cancelled",
        ContextClosedReason::DeadlineExceeded => "deadline_exceeded",
    });
    ContextClosedError::new(reason, pending.iter().map(|t| t.to_string()).collect()).into()
}
