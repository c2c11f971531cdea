//! Readiness strategies for the watchable resource kinds
//!
//! Every supported kind implements [`ReadinessStrategy`] on its k8s-openapi type.
//! [`WatchableResource`] is the closed set of those kinds; anything else is rejected
//! when a target is registered.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Classification of a live object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Readiness {
    Ready,
    NotReady,
    /// The object ran to an end state and will not become ready again
    Terminated,
}

/// Decides whether a fetched object counts as ready or terminated
pub trait ReadinessStrategy {
    fn readiness(&self) -> Readiness;
}

/// `observedGeneration` lags behind `metadata.generation` while a rollout is unobserved
fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    observed.unwrap_or(0) >= generation.unwrap_or(0)
}

fn ready_if(condition: bool) -> Readiness {
    if condition {
        Readiness::Ready
    } else {
        Readiness::NotReady
    }
}

impl ReadinessStrategy for Deployment {
    fn readiness(&self) -> Readiness {
        let Some(status) = &self.status else {
            return Readiness::NotReady;
        };
        if !generation_observed(self.metadata.generation, status.observed_generation) {
            return Readiness::NotReady;
        }
        let desired = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let updated = status.updated_replicas.unwrap_or(0);
        // old replicas still running means the rollout has not finished
        ready_if(
            updated >= desired
                && status.replicas.unwrap_or(0) <= updated
                && status.available_replicas.unwrap_or(0) >= desired
                && status.ready_replicas.unwrap_or(0) >= desired,
        )
    }
}

impl ReadinessStrategy for StatefulSet {
    fn readiness(&self) -> Readiness {
        let Some(status) = &self.status else {
            return Readiness::NotReady;
        };
        if !generation_observed(self.metadata.generation, status.observed_generation) {
            return Readiness::NotReady;
        }
        let desired = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        ready_if(
            status.ready_replicas.unwrap_or(0) >= desired
                && status.updated_replicas.unwrap_or(0) >= desired,
        )
    }
}

impl ReadinessStrategy for DaemonSet {
    fn readiness(&self) -> Readiness {
        let Some(status) = &self.status else {
            return Readiness::NotReady;
        };
        if !generation_observed(self.metadata.generation, status.observed_generation) {
            return Readiness::NotReady;
        }
        let desired = status.desired_number_scheduled;
        ready_if(
            status.number_ready >= desired
                && status.updated_number_scheduled.unwrap_or(0) >= desired
                && status.number_available.unwrap_or(0) >= desired,
        )
    }
}

impl ReadinessStrategy for Pod {
    fn readiness(&self) -> Readiness {
        let Some(status) = &self.status else {
            return Readiness::NotReady;
        };
        match status.phase.as_deref() {
            Some("Succeeded") | Some("Failed") => Readiness::Terminated,
            Some("Running") => ready_if(
                status
                    .conditions
                    .as_ref()
                    .map(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false),
            ),
            _ => Readiness::NotReady,
        }
    }
}

impl ReadinessStrategy for Job {
    fn readiness(&self) -> Readiness {
        let conditions = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let is_true = |type_: &str| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        };
        if is_true("Complete") {
            Readiness::Ready
        } else if is_true("Failed") {
            Readiness::Terminated
        } else {
            Readiness::NotReady
        }
    }
}

/// Resource kinds the progress tracker can watch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchableResource {
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
}

impl WatchableResource {
    pub const ALL: [WatchableResource; 5] = [
        WatchableResource::Pod,
        WatchableResource::Deployment,
        WatchableResource::StatefulSet,
        WatchableResource::DaemonSet,
        WatchableResource::Job,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            WatchableResource::Pod => "Pod",
            WatchableResource::Deployment => "Deployment",
            WatchableResource::StatefulSet => "StatefulSet",
            WatchableResource::DaemonSet => "DaemonSet",
            WatchableResource::Job => "Job",
        }
    }

    /// Classify a fetched object of this kind
    pub fn classify(&self, obj: &serde_json::Value) -> Result<Readiness> {
        match self {
            WatchableResource::Pod => classify_as::<Pod>(obj),
            WatchableResource::Deployment => classify_as::<Deployment>(obj),
            WatchableResource::StatefulSet => classify_as::<StatefulSet>(obj),
            WatchableResource::DaemonSet => classify_as::<DaemonSet>(obj),
            WatchableResource::Job => classify_as::<Job>(obj),
        }
    }
}

fn classify_as<K>(obj: &serde_json::Value) -> Result<Readiness>
where
    K: ReadinessStrategy + DeserializeOwned,
{
    Ok(K::deserialize(obj)?.readiness())
}

impl fmt::Display for WatchableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl FromStr for WatchableResource {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        WatchableResource::ALL
            .into_iter()
            .find(|w| w.kind().eq_ignore_ascii_case(kind))
            .ok_or_else(|| Error::UnsupportedKind(kind.to_string()))
    }
}
