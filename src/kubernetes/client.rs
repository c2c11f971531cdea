//! kube-rs backed implementation of [`KubernetesClient`]

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ClientProvider, KubernetesClient, Resource, WatchableResource};
use crate::cluster::ClusterState;
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "reconciler-mothership";

/// Client talking to one cluster's API server
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn fetch<K>(&self, namespace: &str, name: &str) -> Result<Option<serde_json::Value>>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    /// Resolve the dynamic API for a manifest object and return it with its identity
    async fn dynamic_api(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, Resource)> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::ValidationError("manifest object without apiVersion/kind".to_string())
        })?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| Error::ValidationError(format!("invalid apiVersion: {e}")))?;
        let name = obj.metadata.name.clone().ok_or_else(|| {
            Error::ValidationError(format!("{} manifest object without name", gvk.kind))
        })?;

        let (api_resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
        let (api, namespace) = if capabilities.scope == Scope::Namespaced {
            let namespace = obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            (
                Api::namespaced_with(self.client.clone(), &namespace, &api_resource),
                namespace,
            )
        } else {
            (Api::all_with(self.client.clone(), &api_resource), String::new())
        };
        Ok((api, Resource::new(gvk.kind, namespace, name)))
    }
}

/// Split a multi-document YAML manifest into dynamic objects, skipping empty documents
fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

#[async_trait]
impl KubernetesClient for KubeClient {
    async fn get(
        &self,
        kind: WatchableResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        match kind {
            WatchableResource::Pod => self.fetch::<Pod>(namespace, name).await,
            WatchableResource::Deployment => self.fetch::<Deployment>(namespace, name).await,
            WatchableResource::StatefulSet => self.fetch::<StatefulSet>(namespace, name).await,
            WatchableResource::DaemonSet => self.fetch::<DaemonSet>(namespace, name).await,
            WatchableResource::Job => self.fetch::<Job>(namespace, name).await,
        }
    }

    async fn deploy(&self, manifest: &str) -> Result<Vec<Resource>> {
        let mut deployed = Vec::new();
        for obj in parse_manifest(manifest)? {
            let (api, resource) = self.dynamic_api(&obj).await?;
            api.patch(
                &resource.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
            info!("Applied {}", resource);
            deployed.push(resource);
        }
        Ok(deployed)
    }

    async fn delete(&self, manifest: &str) -> Result<Vec<Resource>> {
        let mut deleted = Vec::new();
        for obj in parse_manifest(manifest)? {
            let (api, resource) = self.dynamic_api(&obj).await?;
            match api.delete(&resource.name, &DeleteParams::default()).await {
                Ok(_) => info!("Deleted {}", resource),
                Err(kube::Error::Api(err)) if err.code == 404 => {
                    debug!("{} already gone", resource);
                }
                Err(e) => return Err(e.into()),
            }
            deleted.push(resource);
        }
        Ok(deleted)
    }
}

/// Builds a client from the kubeconfig stored with the cluster
#[derive(Clone, Debug, Default)]
pub struct KubeconfigClientProvider;

#[async_trait]
impl ClientProvider for KubeconfigClientProvider {
    async fn client_for(&self, cluster: &ClusterState) -> Result<Arc<dyn KubernetesClient>> {
        let raw = cluster.kubeconfig.as_deref().ok_or_else(|| {
            Error::ConfigError(format!("cluster '{}' has no kubeconfig", cluster.cluster))
        })?;
        let kubeconfig = Kubeconfig::from_yaml(raw)
            .map_err(|e| Error::ConfigError(format!("invalid kubeconfig: {e}")))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::ConfigError(format!("unusable kubeconfig: {e}")))?;
        let client = kube::Client::try_from(config)?;
        Ok(Arc::new(KubeClient::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_skips_empty_documents() {
        let manifest = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: first
  namespace: kyma-system
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: second
"#;
        let objects = parse_manifest(manifest).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("first"));
        assert_eq!(
            objects[1].types.as_ref().map(|t| t.kind.as_str()),
            Some("Deployment")
        );
    }

    #[test]
    fn test_parse_manifest_rejects_garbage() {
        assert!(parse_manifest("kind: [unclosed").is_err());
    }

    #[tokio::test]
    async fn test_provider_requires_kubeconfig() {
        let state = ClusterState {
            cluster: "c1".to_string(),
            cluster_version: 1,
            config_version: 1,
            status: Default::default(),
            created: chrono::Utc::now(),
            components: vec![],
            kubeconfig: None,
        };
        let err = KubeconfigClientProvider.client_for(&state).await.err().unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
