//! Tests for the dispatcher

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::cluster::{ClusterModel, ClusterState, ClusterStatus, Component, Inventory, MemoryInventory};
    use crate::error::{Error, Result};
    use crate::kubernetes::{
        ClientProvider, KubernetesClient, ProgressConfig, Resource, WatchableResource,
    };
    use crate::reconciler::{ReconcileRequest, ReconcilerStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Copy, Debug)]
    enum Behaviour {
        /// Reports running, then success two seconds later
        Succeed,
        /// Reports an error through the callback
        Fail,
        /// Rejects the invocation
        Refuse,
        /// Accepts the invocation and never calls back
        Silent,
    }

    struct CallbackInvoker {
        registry: Arc<MemoryOperationsRegistry>,
        behaviours: HashMap<String, Behaviour>,
        requests: Mutex<Vec<ReconcileRequest>>,
    }

    impl CallbackInvoker {
        fn new(registry: Arc<MemoryOperationsRegistry>, behaviours: &[(&str, Behaviour)]) -> Arc<Self> {
            Arc::new(Self {
                registry,
                behaviours: behaviours
                    .iter()
                    .map(|(name, b)| (name.to_string(), *b))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ReconcileRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ComponentInvoker for CallbackInvoker {
        async fn invoke(&self, request: &ReconcileRequest) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            let behaviour = self
                .behaviours
                .get(&request.component)
                .copied()
                .unwrap_or(Behaviour::Succeed);
            let cid = request.correlation_id.clone();
            let sid = request.scheduling_id.clone();
            match behaviour {
                Behaviour::Succeed => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        registry
                            .apply_status(&cid, &sid, ReconcilerStatus::Running, None)
                            .await
                            .unwrap();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        registry
                            .apply_status(&cid, &sid, ReconcilerStatus::Success, None)
                            .await
                            .unwrap();
                    });
                    Ok(())
                }
                Behaviour::Fail => {
                    self.registry
                        .apply_status(&cid, &sid, ReconcilerStatus::Error, Some("helm upgrade failed"))
                        .await
                }
                Behaviour::Refuse => Err(Error::InvocationError("connection refused".to_string())),
                Behaviour::Silent => Ok(()),
            }
        }
    }

    /// Every pod it is asked for is either running and ready or still starting
    struct PodClient {
        ready: bool,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KubernetesClient for PodClient {
        async fn get(
            &self,
            _kind: WatchableResource,
            namespace: &str,
            name: &str,
        ) -> Result<Option<serde_json::Value>> {
            self.fetched
                .lock()
                .unwrap()
                .push(format!("{namespace}/{name}"));
            let (phase, ready) = if self.ready {
                ("Running", "True")
            } else {
                ("Pending", "False")
            };
            Ok(Some(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": name, "namespace": namespace },
                "status": {
                    "phase": phase,
                    "conditions": [{ "type": "Ready", "status": ready }]
                }
            })))
        }

        async fn deploy(&self, _manifest: &str) -> Result<Vec<Resource>> {
            Ok(vec![])
        }

        async fn delete(&self, _manifest: &str) -> Result<Vec<Resource>> {
            Ok(vec![])
        }
    }

    struct StaticClientProvider {
        client: Arc<PodClient>,
    }

    impl StaticClientProvider {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                client: Arc::new(PodClient {
                    ready,
                    fetched: Mutex::new(Vec::new()),
                }),
            })
        }
    }

    #[async_trait]
    impl ClientProvider for StaticClientProvider {
        async fn client_for(&self, _cluster: &ClusterState) -> Result<Arc<dyn KubernetesClient>> {
            Ok(self.client.clone())
        }
    }

    fn component(name: &str, resources: Vec<Resource>) -> Component {
        Component {
            name: name.to_string(),
            namespace: "kyma-system".to_string(),
            version: "1.0.0".to_string(),
            configuration: vec![],
            resources,
        }
    }

    async fn cluster(inventory: &MemoryInventory, name: &str, components: Vec<Component>) -> ClusterState {
        inventory
            .create_or_update(
                1,
                &ClusterModel {
                    cluster: name.to_string(),
                    kubeconfig: Some("apiVersion: v1".to_string()),
                    metadata: Default::default(),
                    components,
                },
            )
            .await
            .unwrap()
    }

    fn config(progress: Option<ProgressConfig>) -> DispatcherConfig {
        DispatcherConfig {
            workers: 2,
            operation_poll_interval: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(60),
            callback_base_url: "http://mothership:8080/".to_string(),
            progress,
        }
    }

    struct Fixture {
        inventory: Arc<MemoryInventory>,
        registry: Arc<MemoryOperationsRegistry>,
        invoker: Arc<CallbackInvoker>,
        dispatcher: Dispatcher,
    }

    fn fixture(behaviours: &[(&str, Behaviour)], config: DispatcherConfig) -> Fixture {
        let inventory = Arc::new(MemoryInventory::new());
        let registry = Arc::new(MemoryOperationsRegistry::new());
        let invoker = CallbackInvoker::new(registry.clone(), behaviours);
        let dispatcher = Dispatcher::new(
            inventory.clone(),
            registry.clone(),
            invoker.clone(),
            config,
        )
        .unwrap();
        Fixture {
            inventory,
            registry,
            invoker,
            dispatcher,
        }
    }

    async fn latest_status(inventory: &MemoryInventory, cluster: &str) -> ClusterStatus {
        inventory.get_latest(cluster).await.unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_marks_cluster_ready() {
        let f = fixture(&[], config(None));
        let state = cluster(
            &f.inventory,
            "c1",
            vec![component("istio", vec![]), component("serverless", vec![])],
        )
        .await;

        let start = Instant::now();
        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status, ClusterStatus::Ready);
        assert_eq!(latest_status(&f.inventory, "c1").await, ClusterStatus::Ready);
        assert!(start.elapsed() >= Duration::from_secs(2));

        let requests = f.invoker.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].scheduling_id, requests[1].scheduling_id);
        assert_ne!(requests[0].correlation_id, requests[1].correlation_id);
        assert_eq!(
            requests[0].callback_url,
            format!(
                "http://mothership:8080/v1/operations/{}/callback/{}",
                requests[0].scheduling_id, requests[0].correlation_id
            )
        );
        assert_eq!(requests[0].kubeconfig.as_deref(), Some("apiVersion: v1"));
        // operations of a finished run are removed
        assert!(f
            .registry
            .get_operations(&requests[0].scheduling_id)
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_component_error_fails_run() {
        let f = fixture(&[("serverless", Behaviour::Fail)], config(None));
        let state = cluster(
            &f.inventory,
            "c1",
            vec![component("istio", vec![]), component("serverless", vec![])],
        )
        .await;

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::ReconcileFailed);
        assert_eq!(
            latest_status(&f.inventory, "c1").await,
            ClusterStatus::ReconcileFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_invocation_fails_run() {
        let f = fixture(&[("istio", Behaviour::Refuse)], config(None));
        let state = cluster(&f.inventory, "c1", vec![component("istio", vec![])]).await;

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::ReconcileFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_callback_times_out() {
        let f = fixture(&[("istio", Behaviour::Silent)], config(None));
        let state = cluster(&f.inventory, "c1", vec![component("istio", vec![])]).await;

        let start = Instant::now();
        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::ReconcileFailed);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_without_components_is_ready() {
        let f = fixture(&[], config(None));
        let state = cluster(&f.inventory, "empty", vec![]).await;

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::Ready);
        assert!(f.invoker.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatchable_resource_is_an_error() {
        let f = fixture(&[], config(Some(ProgressConfig::default())));
        let state = cluster(
            &f.inventory,
            "c1",
            vec![component(
                "istio",
                vec![Resource::new("Service", "istio-system", "istiod")],
            )],
        )
        .await;

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::Error);
        assert!(f.invoker.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_convergence_check() {
        let progress = ProgressConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        };
        let components = vec![component(
            "istio",
            vec![
                Resource::new("Pod", "", "istiod-0"),
                Resource::new("Pod", "istio-system", "ingress-0"),
            ],
        )];

        let ready = StaticClientProvider::new(true);
        let f = fixture(&[], config(Some(progress)));
        let dispatcher = f.dispatcher.with_client_provider(ready.clone());
        let state = cluster(&f.inventory, "c1", components.clone()).await;
        let status = dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::Ready);
        let fetched = ready.client.fetched.lock().unwrap().clone();
        // resources without namespace live in the component's namespace
        assert!(fetched.contains(&"kyma-system/istiod-0".to_string()));
        assert!(fetched.contains(&"istio-system/ingress-0".to_string()));

        let f = fixture(&[], config(Some(progress)));
        let dispatcher = f
            .dispatcher
            .with_client_provider(StaticClientProvider::new(false));
        let state = cluster(&f.inventory, "c2", components).await;
        let status = dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::ReconcileFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_resets_cluster_to_pending() {
        let f = fixture(&[("istio", Behaviour::Silent)], config(None));
        let state = cluster(&f.inventory, "c1", vec![component("istio", vec![])]).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let status = f
            .dispatcher
            .reconcile_cluster(&cancel, state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ClusterStatus::Pending);
        assert_eq!(latest_status(&f.inventory, "c1").await, ClusterStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue() {
        let f = fixture(&[], config(None));
        let (tx, rx) = mpsc::channel(10);
        for name in ["c1", "c2", "c3"] {
            let state = cluster(&f.inventory, name, vec![component("istio", vec![])]).await;
            tx.send(state).await.unwrap();
        }
        drop(tx);

        let dispatcher = Arc::new(f.dispatcher);
        dispatcher.run(CancellationToken::new(), rx).await.unwrap();

        for name in ["c1", "c2", "c3"] {
            assert_eq!(latest_status(&f.inventory, name).await, ClusterStatus::Ready);
        }
        assert_eq!(f.invoker.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_skips_cluster_in_flight() {
        let f = fixture(&[("istio", Behaviour::Silent)], config(None));
        let state = cluster(&f.inventory, "c1", vec![component("istio", vec![])]).await;
        let (tx, rx) = mpsc::channel(10);
        tx.send(state.clone()).await.unwrap();
        tx.send(state).await.unwrap();

        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(f.dispatcher);
        let handle = tokio::spawn(dispatcher.run(cancel.clone(), rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.invoker.requests().len(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(latest_status(&f.inventory, "c1").await, ClusterStatus::Pending);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_configuration_is_not_reapplied() {
        let f = fixture(&[], config(None));
        let v1 = cluster(&f.inventory, "c1", vec![component("istio", vec![])]).await;
        let v2 = cluster(
            &f.inventory,
            "c1",
            vec![component("istio", vec![]), component("serverless", vec![])],
        )
        .await;
        assert_eq!(v2.config_version, v1.config_version + 1);

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), v2.clone())
            .await
            .unwrap();
        assert_eq!(status, Some(ClusterStatus::Ready));
        assert_eq!(f.invoker.requests().len(), 2);

        // the old snapshot and a copy of the already reconciled one are both stale now
        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), v1.clone())
            .await
            .unwrap();
        assert_eq!(status, None);

        let (tx, rx) = mpsc::channel(10);
        tx.send(v1).await.unwrap();
        tx.send(v2.clone()).await.unwrap();
        drop(tx);
        let dispatcher = Arc::new(f.dispatcher);
        dispatcher.run(CancellationToken::new(), rx).await.unwrap();

        assert_eq!(f.invoker.requests().len(), 2);
        let latest = f.inventory.get_latest("c1").await.unwrap();
        assert_eq!(latest.config_version, v2.config_version);
        assert_eq!(latest.status, ClusterStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_cluster_is_skipped() {
        let f = fixture(&[], config(None));
        let state = cluster(&f.inventory, "gone", vec![component("istio", vec![])]).await;
        f.inventory.delete("gone").await.unwrap();

        let status = f
            .dispatcher
            .reconcile_cluster(&CancellationToken::new(), state)
            .await
            .unwrap();
        assert_eq!(status, None);
        assert!(f.invoker.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_copies_run_once_per_config_version() {
        let f = fixture(
            &[],
            DispatcherConfig {
                workers: 1,
                ..config(None)
            },
        );
        for name in ["a", "b"] {
            cluster(&f.inventory, name, vec![component("istio", vec![])]).await;
        }
        let watcher = InventoryWatcher::new(
            f.inventory.clone(),
            InventoryWatchConfig::new(Duration::from_secs(1), Duration::from_secs(15 * 60))
                .unwrap(),
        )
        .unwrap();

        // one worker and a 1s watch interval: pending clusters are queued again while busy
        let (tx, rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let watch = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.run(cancel, tx).await })
        };
        let dispatch = tokio::spawn(Arc::new(f.dispatcher).run(cancel.clone(), rx));

        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        watch.await.unwrap().unwrap();
        dispatch.await.unwrap().unwrap();

        let requests = f.invoker.requests();
        for name in ["a", "b"] {
            assert_eq!(
                requests.iter().filter(|r| r.cluster == name).count(),
                1,
                "cluster {name} reconciled more than once"
            );
            assert_eq!(latest_status(&f.inventory, name).await, ClusterStatus::Ready);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatcherConfig::default().validate().is_ok());
        let config = DispatcherConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
        let config = DispatcherConfig {
            progress: Some(ProgressConfig {
                interval: Duration::ZERO,
                timeout: Duration::from_secs(1),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            DispatcherConfig::default().callback_url("s", "c"),
            "http://localhost:8080/v1/operations/s/callback/c"
        );
    }
}
