//! Operations registry
//!
//! Every component reconciliation dispatched by the mothership is tracked as an
//! [`Operation`] keyed by `(schedulingID, correlationID)`. Component reconcilers
//! report progress out of band through callbacks; those land here.
//!
//! Terminal states (`Success`, `Error`) are sticky: a late or duplicated callback
//! never moves an operation out of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, OperationNotFoundError, Result};
use crate::reconciler::ReconcilerStatus;

/// Reason stored when a reconciler reports `error` without details
pub const DEFAULT_ERROR_REASON: &str = "Reconciler reported error status";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    NotStarted,
    Running,
    Success,
    Error,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Success | OperationState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::NotStarted => "notstarted",
            OperationState::Running => "running",
            OperationState::Success => "success",
            OperationState::Error => "error",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched component reconciliation
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "schedulingID")]
    pub scheduling_id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    pub cluster: String,
    pub component: String,
    pub state: OperationState,
    pub reason: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[async_trait]
pub trait OperationsRegistry: Send + Sync {
    /// Create a `NotStarted` operation; registering the same pair twice is a conflict
    async fn register_operation(
        &self,
        scheduling_id: &str,
        correlation_id: &str,
        cluster: &str,
        component: &str,
    ) -> Result<Operation>;

    async fn get_operation(&self, correlation_id: &str, scheduling_id: &str) -> Option<Operation>;

    /// All operations of one scheduling run
    async fn get_operations(&self, scheduling_id: &str) -> Vec<Operation>;

    async fn set_in_progress(&self, correlation_id: &str, scheduling_id: &str) -> Result<()>;

    async fn set_done(&self, correlation_id: &str, scheduling_id: &str) -> Result<()>;

    async fn set_error(&self, correlation_id: &str, scheduling_id: &str, reason: &str)
        -> Result<()>;

    /// Drop every operation of a finished scheduling run, returns how many were removed
    async fn remove_operations(&self, scheduling_id: &str) -> usize;

    /// Apply a status reported by a component reconciler
    async fn apply_status(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        status: ReconcilerStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        match status {
            ReconcilerStatus::NotStarted | ReconcilerStatus::Running => {
                self.set_in_progress(correlation_id, scheduling_id).await
            }
            ReconcilerStatus::Success => self.set_done(correlation_id, scheduling_id).await,
            ReconcilerStatus::Error => {
                let reason = reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or(DEFAULT_ERROR_REASON);
                self.set_error(correlation_id, scheduling_id, reason).await
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct OperationKey {
    scheduling_id: String,
    correlation_id: String,
}

impl OperationKey {
    fn new(scheduling_id: &str, correlation_id: &str) -> Self {
        Self {
            scheduling_id: scheduling_id.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// In-memory registry.
///
/// The map lock is only held to look up or insert an entry; transitions lock the
/// single operation, so callbacks for different operations never wait on each other.
// TODO: sweep operations that never receive a callback once their scheduling run
// has been abandoned (today only the dispatcher's operation timeout bounds them).
#[derive(Default)]
pub struct MemoryOperationsRegistry {
    operations: RwLock<HashMap<OperationKey, Arc<Mutex<Operation>>>>,
}

impl MemoryOperationsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, correlation_id: &str, scheduling_id: &str) -> Result<Arc<Mutex<Operation>>> {
        self.operations
            .read()
            .await
            .get(&OperationKey::new(scheduling_id, correlation_id))
            .cloned()
            .ok_or_else(|| {
                OperationNotFoundError {
                    scheduling_id: scheduling_id.to_string(),
                    correlation_id: correlation_id.to_string(),
                }
                .into()
            })
    }

    async fn transition(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        next: OperationState,
        reason: Option<&str>,
    ) -> Result<()> {
        let entry = self.entry(correlation_id, scheduling_id).await?;
        let mut op = entry.lock().await;

        if op.state.is_terminal() {
            if op.state != next {
                debug!(
                    "Ignoring transition of operation {}/{} from terminal state {} to {}",
                    scheduling_id, correlation_id, op.state, next
                );
            }
            return Ok(());
        }
        if op.state == next {
            return Ok(());
        }

        debug!(
            "Operation {}/{} ({} on {}): {} -> {}",
            scheduling_id, correlation_id, op.component, op.cluster, op.state, next
        );
        op.state = next;
        op.reason = reason.map(str::to_string);
        op.updated = Utc::now();

        #[cfg(feature = "metrics")]
        crate::metrics::inc_operation_transition(next.as_str());
        Ok(())
    }
}

#[async_trait]
impl OperationsRegistry for MemoryOperationsRegistry {
    async fn register_operation(
        &self,
        scheduling_id: &str,
        correlation_id: &str,
        cluster: &str,
        component: &str,
    ) -> Result<Operation> {
        let key = OperationKey::new(scheduling_id, correlation_id);
        let mut operations = self.operations.write().await;
        if operations.contains_key(&key) {
            return Err(Error::OperationConflict(format!(
                "schedulingID '{scheduling_id}', correlationID '{correlation_id}'"
            )));
        }
        let now = Utc::now();
        let op = Operation {
            scheduling_id: scheduling_id.to_string(),
            correlation_id: correlation_id.to_string(),
            cluster: cluster.to_string(),
            component: component.to_string(),
            state: OperationState::NotStarted,
            reason: None,
            created: now,
            updated: now,
        };
        operations.insert(key, Arc::new(Mutex::new(op.clone())));
        #[cfg(feature = "metrics")]
        crate::metrics::inc_operation_transition(OperationState::NotStarted.as_str());
        Ok(op)
    }

    async fn get_operation(&self, correlation_id: &str, scheduling_id: &str) -> Option<Operation> {
        let entry = self.entry(correlation_id, scheduling_id).await.ok()?;
        let op = entry.lock().await;
        Some(op.clone())
    }

    async fn get_operations(&self, scheduling_id: &str) -> Vec<Operation> {
        let entries: Vec<_> = self
            .operations
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.scheduling_id == scheduling_id)
            .map(|(_, entry)| entry.clone())
            .collect();

        let mut operations = Vec::with_capacity(entries.len());
        for entry in entries {
            operations.push(entry.lock().await.clone());
        }
        operations.sort_by(|a, b| a.component.cmp(&b.component));
        operations
    }

    async fn set_in_progress(&self, correlation_id: &str, scheduling_id: &str) -> Result<()> {
        self.transition(correlation_id, scheduling_id, OperationState::Running, None)
            .await
    }

    async fn set_done(&self, correlation_id: &str, scheduling_id: &str) -> Result<()> {
        self.transition(correlation_id, scheduling_id, OperationState::Success, None)
            .await
    }

    async fn set_error(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.transition(
            correlation_id,
            scheduling_id,
            OperationState::Error,
            Some(reason),
        )
        .await
    }

    async fn remove_operations(&self, scheduling_id: &str) -> usize {
        let mut operations = self.operations.write().await;
        let before = operations.len();
        operations.retain(|key, _| key.scheduling_id != scheduling_id);
        let removed = before - operations.len();
        if removed > 0 {
            info!(
                "Removed {} operation(s) of scheduling run {}",
                removed, scheduling_id
            );
        }
        removed
    }
}
