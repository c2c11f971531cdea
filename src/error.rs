//! Error types for the reconciliation scheduling engine

use std::fmt;

use thiserror::Error;

/// Why a blocking watch stopped before its targets converged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextClosedReason {
    /// The caller's cancellation token fired (usually shutdown)
    Cancelled,
    /// The configured timeout elapsed
    DeadlineExceeded,
}

impl fmt::Display for ContextClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextClosedReason::Cancelled => write!(f, "cancelled"),
            ContextClosedReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// A watch ran out of time or was cancelled while targets were still pending.
///
/// Callers use this to tell "still converging" apart from a definite failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("context closed ({reason}) while waiting for {} resource(s): {}", .pending.len(), .pending.join(", "))]
pub struct ContextClosedError {
    pub reason: ContextClosedReason,
    pub pending: Vec<String>,
}

impl ContextClosedError {
    pub fn new(reason: ContextClosedReason, pending: Vec<String>) -> Self {
        Self { reason, pending }
    }
}

/// A callback referenced a (schedulingID, correlationID) pair nobody registered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("operation with schedulingID '{scheduling_id}' and correlationID '{correlation_id}' not found")]
pub struct OperationNotFoundError {
    pub scheduling_id: String,
    pub correlation_id: String,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Rejected input (status strings, cluster models, durations)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Inventory lookup found nothing
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    OperationNotFound(#[from] OperationNotFoundError),

    #[error("Operation already registered: {0}")]
    OperationConflict(String),

    #[error(transparent)]
    ContextClosed(#[from] ContextClosedError),

    /// The resource kind has no readiness strategy
    #[error("Resource kind '{0}' is not watchable")]
    UnsupportedKind(String),

    /// Component reconciler could not be reached or refused the request
    #[error("Component reconciler invocation failed: {0}")]
    InvocationError(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// True for inventory and operation lookups that found nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::OperationNotFound(_))
    }

    pub fn is_context_closed(&self) -> bool {
        matches!(self, Error::ContextClosed(_))
    }

    /// Short, stable label used for metrics and log fields
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) | Error::UnsupportedKind(_) => "validation",
            Error::NotFound(_) | Error::OperationNotFound(_) => "not_found",
            Error::OperationConflict(_) => "conflict",
            Error::ContextClosed(_) => "context_closed",
            Error::InvocationError(_) | Error::HttpError(_) => "invocation",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::IoError(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
