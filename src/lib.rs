//! Cluster reconciler: the reconciliation scheduling engine of a fleet of managed
//! Kubernetes clusters.
//!
//! The inventory watcher discovers clusters due for reconciliation, the dispatcher
//! hands their components to remote reconcilers and tracks the resulting operations,
//! and the progress tracker verifies that the declared resources converged.

pub mod cluster;
pub mod error;
pub mod kubernetes;
pub mod reconciler;
pub mod scheduler;
pub mod telemetry;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
