//! HTTP handlers for the REST API

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::HOST, HeaderMap, StatusCode},
    Json,
};
use kube::config::Kubeconfig;
use tracing::{debug, error, instrument, warn};

use crate::cluster::ClusterModel;
use crate::error::Error;
use crate::reconciler::CallbackMessage;

use super::dto::{
    CallbackResponse, ClusterResponse, ErrorResponse, HealthResponse, StatusChangeResponse,
    StatusChangesQuery, StatusChangesResponse,
};
use super::ApiState;

/// Offset of the status history when the client sends none (one week)
pub const DEFAULT_STATUS_CHANGES_OFFSET: &str = "168h";

pub type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

/// Map a crate error to a response; `context` prefixes the message
fn from_error(context: &str, err: &Error) -> ApiError {
    let status = match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        Error::ValidationError(_) | Error::UnsupportedKind(_) => StatusCode::BAD_REQUEST,
        Error::OperationConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("{}: {}", context, err);
    }
    api_error(status, format!("{context}: {err}"))
}

/// Contract versions are sent as `v<N>` path segments
fn contract_version(segment: &str) -> ApiResult<i64> {
    segment
        .strip_prefix('v')
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Contract version undefined: '{segment}'"),
            )
        })
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn validate_kubeconfig(model: &ClusterModel) -> ApiResult<()> {
    let raw = model
        .kubeconfig
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "kubeconfig not accepted: missing"))?;
    Kubeconfig::from_yaml(raw)
        .map(|_| ())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("kubeconfig not accepted: {e}")))
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Register a cluster or store a new configuration for it
#[instrument(skip(state, headers, payload), fields(version = %version))]
pub async fn create_or_update_cluster(
    State(state): State<Arc<ApiState>>,
    Path(version): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<ClusterModel>, JsonRejection>,
) -> ApiResult<Json<ClusterResponse>> {
    let contract = contract_version(&version)?;
    let Json(model) = payload.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to unmarshal JSON payload: {}", e.body_text()),
        )
    })?;
    validate_kubeconfig(&model)?;

    let cluster_state = state
        .inventory
        .create_or_update(contract, &model)
        .await
        .map_err(|e| from_error("Failed to create or update cluster entity", &e))?;
    debug!("Stored {}", cluster_state);
    Ok(Json(ClusterResponse::new(
        &cluster_state,
        &base_url(&headers),
        contract,
    )))
}

#[instrument(skip(state), fields(cluster = %cluster))]
pub async fn delete_cluster(
    State(state): State<Arc<ApiState>>,
    Path((version, cluster)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    contract_version(&version)?;
    state.inventory.delete(&cluster).await.map_err(|e| {
        from_error(
            &format!("Deletion impossible: cluster '{cluster}'"),
            &e,
        )
    })?;
    Ok(StatusCode::OK)
}

#[instrument(skip(state, headers), fields(cluster = %cluster))]
pub async fn get_cluster_config_status(
    State(state): State<Arc<ApiState>>,
    Path((version, cluster, config_version)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<ClusterResponse>> {
    let contract = contract_version(&version)?;
    let config_version: i64 = config_version.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid configuration version '{config_version}'"),
        )
    })?;
    let cluster_state = state
        .inventory
        .get(&cluster, config_version)
        .await
        .map_err(|e| from_error("Could not retrieve cluster state", &e))?;
    Ok(Json(ClusterResponse::new(
        &cluster_state,
        &base_url(&headers),
        contract,
    )))
}

#[instrument(skip(state, headers), fields(cluster = %cluster))]
pub async fn get_latest_cluster_status(
    State(state): State<Arc<ApiState>>,
    Path((version, cluster)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<ClusterResponse>> {
    let contract = contract_version(&version)?;
    let cluster_state = state
        .inventory
        .get_latest(&cluster)
        .await
        .map_err(|e| from_error("Could not retrieve cluster state", &e))?;
    Ok(Json(ClusterResponse::new(
        &cluster_state,
        &base_url(&headers),
        contract,
    )))
}

/// Status history of a cluster, `offset` bounds how far back it reaches
#[instrument(skip(state, query), fields(cluster = %cluster))]
pub async fn status_changes(
    State(state): State<Arc<ApiState>>,
    Path((version, cluster)): Path<(String, String)>,
    Query(query): Query<StatusChangesQuery>,
) -> ApiResult<Json<StatusChangesResponse>> {
    contract_version(&version)?;
    let offset = query
        .offset
        .filter(|o| !o.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STATUS_CHANGES_OFFSET.to_string());
    let offset: Duration = humantime::parse_duration(&offset).map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid offset '{offset}': {e}"),
        )
    })?;
    debug!("Using an offset of {:?} for cluster status changes", offset);

    let changes = state
        .inventory
        .status_changes(&cluster, offset)
        .await
        .map_err(|e| from_error("Could not retrieve cluster statusChanges", &e))?;
    Ok(Json(StatusChangesResponse {
        status_changes: changes.iter().map(StatusChangeResponse::from).collect(),
    }))
}

/// Callback of a component reconciler reporting the state of one operation
#[instrument(skip(state, payload), fields(scheduling_id = %scheduling_id, correlation_id = %correlation_id))]
pub async fn operation_callback(
    State(state): State<Arc<ApiState>>,
    Path((version, scheduling_id, correlation_id)): Path<(String, String, String)>,
    payload: Result<Json<CallbackMessage>, JsonRejection>,
) -> ApiResult<Json<CallbackResponse>> {
    contract_version(&version)?;
    let Json(message) = payload.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to unmarshal JSON payload: {}", e.body_text()),
        )
    })?;
    if message.status.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "status not provided in payload",
        ));
    }
    let status = message
        .parsed_status()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    state
        .operations
        .apply_status(
            &correlation_id,
            &scheduling_id,
            status,
            message.error.as_deref(),
        )
        .await
        .map_err(|e| {
            warn!("Rejected callback: {}", e);
            let code = if e.is_not_found() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            };
            api_error(code, e.to_string())
        })?;

    Ok(Json(CallbackResponse {
        scheduling_id,
        correlation_id,
        status: status.to_string(),
    }))
}

/// Prometheus text exposition of the mothership metrics
#[cfg(feature = "metrics")]
pub async fn metrics() -> ApiResult<String> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::metrics::REGISTRY).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
    })?;
    Ok(buffer)
}
