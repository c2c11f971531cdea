//! Cluster reconciliation status

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle of one cluster configuration version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Queued, not yet started
    #[default]
    Pending,
    /// Dispatched, operations in flight
    Reconciling,
    /// Failed for this configuration version; retried on a later watch cycle
    ReconcileFailed,
    /// All operations succeeded and, where checked, live resources converged
    Ready,
    /// Non-recoverable
    Error,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "reconcile_pending",
            ClusterStatus::Reconciling => "reconciling",
            ClusterStatus::ReconcileFailed => "reconcile_failed",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Error => "error",
        }
    }

    /// Whether the inventory should hand this cluster out again without waiting
    /// for the reconcile interval
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Pending | ClusterStatus::ReconcileFailed
        )
    }

    /// Status as exposed to the external reporting API.
    ///
    /// A failed run is reported as still reconciling because it will be retried.
    pub fn external(&self) -> ExternalClusterStatus {
        match self {
            ClusterStatus::Pending => ExternalClusterStatus::Pending,
            ClusterStatus::Reconciling | ClusterStatus::ReconcileFailed => {
                ExternalClusterStatus::Reconciling
            }
            ClusterStatus::Ready => ExternalClusterStatus::Ready,
            ClusterStatus::Error => ExternalClusterStatus::Error,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile_pending" => Ok(ClusterStatus::Pending),
            "reconciling" => Ok(ClusterStatus::Reconciling),
            "reconcile_failed" => Ok(ClusterStatus::ReconcileFailed),
            "ready" => Ok(ClusterStatus::Ready),
            "error" => Ok(ClusterStatus::Error),
            other => Err(Error::ValidationError(format!(
                "unknown cluster status '{other}'"
            ))),
        }
    }
}

/// Cluster status in the external reporting schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalClusterStatus {
    Pending,
    Reconciling,
    Ready,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_mapping() {
        assert_eq!(
            ClusterStatus::Pending.external(),
            ExternalClusterStatus::Pending
        );
        assert_eq!(
            ClusterStatus::ReconcileFailed.external(),
            ExternalClusterStatus::Reconciling
        );
        assert_eq!(ClusterStatus::Ready.external(), ExternalClusterStatus::Ready);
        assert_eq!(ClusterStatus::Error.external(), ExternalClusterStatus::Error);
    }

    #[test]
    fn test_parse_round_trip() {
        for status in [
            ClusterStatus::Pending,
            ClusterStatus::Reconciling,
            ClusterStatus::ReconcileFailed,
            ClusterStatus::Ready,
            ClusterStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ClusterStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ClusterStatus>().is_err());
    }

    #[test]
    fn test_needs_reconciliation() {
        assert!(ClusterStatus::Pending.needs_reconciliation());
        assert!(ClusterStatus::ReconcileFailed.needs_reconciliation());
        assert!(!ClusterStatus::Reconciling.needs_reconciliation());
        assert!(!ClusterStatus::Ready.needs_reconciliation());
        assert!(!ClusterStatus::Error.needs_reconciliation());
    }
}
