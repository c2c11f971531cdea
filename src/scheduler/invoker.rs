//! Invocation of remote component reconcilers

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::reconciler::ReconcileRequest;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands one operation to the reconciler responsible for its component
#[async_trait]
pub trait ComponentInvoker: Send + Sync {
    async fn invoke(&self, request: &ReconcileRequest) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReconcilerEndpoint {
    pub url: String,
}

/// Component name to reconciler endpoint, loaded from YAML:
///
/// ```yaml
/// istio:
///   url: http://istio-reconciler:8080/v1/run
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ReconcilersConfig {
    endpoints: HashMap<String, ReconcilerEndpoint>,
}

impl ReconcilersConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "cannot read reconcilers file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn url_for(&self, component: &str) -> Option<&str> {
        self.endpoints.get(component).map(|e| e.url.as_str())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// POSTs the reconcile request as JSON to the component's reconciler
pub struct RemoteInvoker {
    http_client: Client,
    reconcilers: ReconcilersConfig,
    default_url: Option<String>,
}

impl RemoteInvoker {
    pub fn new(reconcilers: ReconcilersConfig, default_url: Option<String>) -> Result<Self> {
        Self::with_timeout(reconcilers, default_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        reconcilers: ReconcilersConfig,
        default_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            reconcilers,
            default_url,
        })
    }

    fn endpoint(&self, component: &str) -> Result<&str> {
        self.reconcilers
            .url_for(component)
            .or(self.default_url.as_deref())
            .ok_or_else(|| {
                Error::InvocationError(format!(
                    "no reconciler configured for component '{component}'"
                ))
            })
    }
}

#[async_trait]
impl ComponentInvoker for RemoteInvoker {
    #[instrument(
        skip(self, request),
        fields(
            component = %request.component,
            scheduling_id = %request.scheduling_id,
            correlation_id = %request.correlation_id
        )
    )]
    async fn invoke(&self, request: &ReconcileRequest) -> Result<()> {
        let url = self.endpoint(&request.component)?;
        debug!("Invoking reconciler at {}", url);

        let response = self.http_client.post(url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvocationError(format!(
                "reconciler for '{}' responded with {}: {}",
                request.component,
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(component: &str) -> ReconcileRequest {
        ReconcileRequest {
            scheduling_id: "s1".to_string(),
            correlation_id: "c1".to_string(),
            cluster: "cluster-1".to_string(),
            component: component.to_string(),
            namespace: "kyma-system".to_string(),
            version: "2.0.0".to_string(),
            configuration: vec![],
            kubeconfig: None,
            callback_url: "http://localhost:8080/v1/operations/s1/callback/c1".to_string(),
        }
    }

    #[test]
    fn test_reconcilers_config_from_yaml() {
        let config = ReconcilersConfig::from_yaml(
            "istio:\n  url: http://istio:8080/v1/run\ncluster-essentials:\n  url: http://ce:8080/v1/run\n",
        )
        .unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.url_for("istio"), Some("http://istio:8080/v1/run"));
        assert_eq!(config.url_for("unknown"), None);
        assert!(ReconcilersConfig::from_yaml("").unwrap().is_empty());
        assert!(ReconcilersConfig::from_yaml("istio: [").is_err());
    }

    #[tokio::test]
    async fn test_invoke_posts_request_to_component_url() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/istio/v1/run"))
            .and(body_partial_json(serde_json::json!({
                "schedulingID": "s1",
                "correlationID": "c1",
                "component": "istio"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = ReconcilersConfig::from_yaml(&format!(
            "istio:\n  url: {}/istio/v1/run\n",
            mock_server.uri()
        ))
        .unwrap();
        let invoker = RemoteInvoker::new(config, None).unwrap();
        invoker.invoke(&request("istio")).await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_falls_back_to_default_url() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/run"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let invoker = RemoteInvoker::new(
            ReconcilersConfig::default(),
            Some(format!("{}/v1/run", mock_server.uri())),
        )
        .unwrap();
        invoker.invoke(&request("serverless")).await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_rejects_non_success_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let invoker =
            RemoteInvoker::new(ReconcilersConfig::default(), Some(mock_server.uri())).unwrap();
        let err = invoker.invoke(&request("istio")).await.unwrap_err();
        assert!(matches!(err, Error::InvocationError(ref msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_invoke_without_endpoint() {
        let invoker = RemoteInvoker::new(ReconcilersConfig::default(), None).unwrap();
        let err = invoker.invoke(&request("istio")).await.unwrap_err();
        assert!(matches!(err, Error::InvocationError(_)));
    }
}
