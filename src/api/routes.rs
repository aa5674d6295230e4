/*
* HTTP API
* --------
* Thin axum layer over the Coordinator; every handler is one call.
*
*   GET    {prefix}/clusters/{cluster}                         cluster snapshot
*   GET    {prefix}/clusters/{cluster}/status                  counts per state
*   POST   {prefix}/clusters/{cluster}/vms/{name}/transition   {"target": "running"}
*   POST   {prefix}/clusters/{cluster}/vms/{name}/restart
*   DELETE {prefix}/clusters/{cluster}/vms/{name}              forget a destroyed VM
*   GET    {prefix}/gpus                                       live allocation table
*   GET    {prefix}/integrity                                  records vs. table diff
*   GET    {prefix}/drift                                      records vs. hypervisor
*   POST   {prefix}/preflight                                  shared-GPU check
*   POST   {prefix}/populate                                   load a merged config
*/

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiError;
use crate::config::cluster::MergedConfig;
use crate::coordinator::Coordinator;
use crate::core::vm::VmState;
use crate::state::models::ClusterKind;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub target: VmState,
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let server = &app_state.coordinator.settings().server;
    let prefix = server.api_prefix.clone();
    let max_body = server.max_body_bytes;

    let api = Router::new()
        .route("/clusters/{cluster}", get(get_cluster))
        .route("/clusters/{cluster}/status", get(cluster_status))
        .route("/clusters/{cluster}/vms/{name}", delete(forget_vm))
        .route("/clusters/{cluster}/vms/{name}/transition", post(transition_vm))
        .route("/clusters/{cluster}/vms/{name}/restart", post(restart_vm))
        .route("/gpus", get(list_gpus))
        .route("/integrity", get(verify_integrity))
        .route("/drift", get(detect_drift))
        .route("/preflight", post(preflight))
        .route("/populate", post(populate));

    let router = if prefix.is_empty() || prefix == "/" {
        api
    } else {
        Router::new().nest(&prefix, api)
    };

    router
        .fallback(fallback_handler)
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body)),
        )
}

async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<ClusterKind>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.get_cluster_snapshot(cluster).await?))
}

async fn cluster_status(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<ClusterKind>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.cluster_status(cluster).await?))
}

async fn transition_vm(
    State(state): State<Arc<AppState>>,
    Path((cluster, name)): Path<(ClusterKind, String)>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .coordinator
        .request_transition(cluster, &name, request.target)
        .await?;
    Ok(Json(outcome))
}

async fn restart_vm(
    State(state): State<Arc<AppState>>,
    Path((cluster, name)): Path<(ClusterKind, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.restart(cluster, &name).await?))
}

async fn forget_vm(
    State(state): State<Arc<AppState>>,
    Path((cluster, name)): Path<(ClusterKind, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.forget_vm(cluster, &name).await?))
}

async fn list_gpus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.list_gpu_allocations())
}

async fn verify_integrity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.verify_integrity().await)
}

async fn detect_drift(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.detect_drift().await)
}

async fn preflight(
    State(state): State<Arc<AppState>>,
    Json(config): Json<MergedConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.run_preflight_validation(&config)?))
}

async fn populate(
    State(state): State<Arc<AppState>>,
    Json(config): Json<MergedConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.populate_from_config(&config).await?))
}

async fn fallback_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
