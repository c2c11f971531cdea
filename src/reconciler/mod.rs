//! Wire model shared with component reconcilers
//!
//! The mothership sends a [`ReconcileRequest`] to a component reconciler and receives
//! [`CallbackMessage`]s on the callback URL embedded in that request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cluster::Configuration;
use crate::error::{Error, Result};

/// Status a component reconciler reports through its callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconcilerStatus {
    NotStarted,
    Running,
    Success,
    Error,
}

impl ReconcilerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilerStatus::NotStarted => "notstarted",
            ReconcilerStatus::Running => "running",
            ReconcilerStatus::Success => "success",
            ReconcilerStatus::Error => "error",
        }
    }
}

impl fmt::Display for ReconcilerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcilerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => Err(Error::ValidationError("status must not be empty".to_string())),
            "notstarted" => Ok(ReconcilerStatus::NotStarted),
            "running" => Ok(ReconcilerStatus::Running),
            "success" => Ok(ReconcilerStatus::Success),
            "error" => Ok(ReconcilerStatus::Error),
            other => Err(Error::ValidationError(format!(
                "unknown reconciler status '{other}'"
            ))),
        }
    }
}

/// Body of `POST .../operations/{schedulingID}/callback/{correlationID}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackMessage {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackMessage {
    pub fn parsed_status(&self) -> Result<ReconcilerStatus> {
        self.status.parse()
    }
}

/// Request handed to a component reconciler for one operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(rename = "schedulingID")]
    pub scheduling_id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    pub cluster: String,
    pub component: String,
    pub namespace: String,
    pub version: String,
    pub configuration: Vec<Configuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(rename = "callbackURL")]
    pub callback_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            "Running".parse::<ReconcilerStatus>().unwrap(),
            ReconcilerStatus::Running
        );
        assert_eq!(
            "notstarted".parse::<ReconcilerStatus>().unwrap(),
            ReconcilerStatus::NotStarted
        );
        assert_eq!(
            "SUCCESS".parse::<ReconcilerStatus>().unwrap(),
            ReconcilerStatus::Success
        );
        assert!(matches!(
            "".parse::<ReconcilerStatus>(),
            Err(Error::ValidationError(_))
        ));
        assert!("finished".parse::<ReconcilerStatus>().is_err());
    }

    #[test]
    fn test_callback_message_without_status() {
        let msg: CallbackMessage = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(msg.parsed_status().is_err());
        assert_eq!(msg.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_request_wire_names() {
        let request = ReconcileRequest {
            scheduling_id: "s1".to_string(),
            correlation_id: "c1".to_string(),
            cluster: "c".to_string(),
            component: "istio".to_string(),
            namespace: "istio-system".to_string(),
            version: "1.2.3".to_string(),
            configuration: vec![],
            kubeconfig: None,
            callback_url: "http://mothership/v1/operations/s1/callback/c1".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["schedulingID"], "s1");
        assert_eq!(json["correlationID"], "c1");
        assert!(json["callbackURL"].as_str().unwrap().ends_with("/callback/c1"));
        assert!(json.get("kubeconfig").is_none());
    }
}
