//! Progress tracking for deployed resources
//!
//! A [`ProgressTracker`] polls a fixed set of targets through a
//! [`KubernetesClient`](crate::kubernetes::KubernetesClient) until all of them are
//! ready (or gone), the timeout elapses, or the caller cancels.

mod readiness;
mod tracker;

pub use readiness::{Readiness, ReadinessStrategy, WatchableResource};
pub use tracker::{ProgressConfig, ProgressTracker, TargetState};
