//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{Error, Result};

use super::handlers;
use super::ApiState;

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// PEM encoded certificate chain and private key
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls: None,
        }
    }
}

/// Build the router with every mothership endpoint
pub fn router(state: Arc<ApiState>) -> Router {
    let app = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/{version}/clusters",
            put(handlers::create_or_update_cluster).post(handlers::create_or_update_cluster),
        )
        .route("/{version}/clusters/{cluster}", delete(handlers::delete_cluster))
        .route(
            "/{version}/clusters/{cluster}/configs/{config_version}/status",
            get(handlers::get_cluster_config_status),
        )
        .route(
            "/{version}/clusters/{cluster}/status",
            get(handlers::get_latest_cluster_status),
        )
        .route(
            "/{version}/clusters/{cluster}/statusChanges",
            get(handlers::status_changes),
        )
        .route(
            "/{version}/operations/{scheduling_id}/callback/{correlation_id}",
            post(handlers::operation_callback),
        );

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until `cancel` fires
pub async fn run_server(
    state: Arc<ApiState>,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some(tls) = config.tls {
        info!("REST API server listening on {} with TLS", addr);
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to load TLS certificate {} / key {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                ))
            })?;

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
        });

        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    } else {
        info!("REST API server listening on {} (insecure)", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    }

    info!("REST API server stopped");
    Ok(())
}
