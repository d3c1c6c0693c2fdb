//! Controller HTTP routes

use crate::registry::Registry;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use llmops_common::{LlmOpsError, Result, METRICS};
use llmops_proto::{
    HeartbeatRecord, HeartbeatResponse, ListModelsResponse, RegisterWorkerRequest,
    WorkerAddressRequest, WorkerAddressResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    enable_metrics: bool,
}

pub fn build_router(registry: Arc<Registry>, enable_metrics: bool) -> Router {
    let state = AppState {
        registry,
        enable_metrics,
    };

    Router::new()
        .route("/register_worker", post(register_worker_handler))
        .route("/receive_heart_beat", post(receive_heart_beat_handler))
        .route("/list_models", post(list_models_handler).get(list_models_handler))
        .route("/get_worker_address", post(get_worker_address_handler))
        .route("/refresh_all_workers", post(refresh_all_workers_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    registry: Arc<Registry>,
    addr: SocketAddr,
    enable_metrics: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(registry, enable_metrics);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| LlmOpsError::config(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("Controller listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn register_worker_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<Json<serde_json::Value>> {
    state.registry.register_worker(request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn receive_heart_beat_handler(
    State(state): State<AppState>,
    Json(record): Json<HeartbeatRecord>,
) -> Json<HeartbeatResponse> {
    let exist = state.registry.receive_heart_beat(&record).await;
    Json(HeartbeatResponse { exist })
}

async fn list_models_handler(State(state): State<AppState>) -> Json<ListModelsResponse> {
    Json(ListModelsResponse {
        models: state.registry.list_models().await,
    })
}

async fn get_worker_address_handler(
    State(state): State<AppState>,
    Json(request): Json<WorkerAddressRequest>,
) -> Result<Json<WorkerAddressResponse>> {
    let address = state.registry.get_worker_address(&request.model).await?;
    Ok(Json(WorkerAddressResponse { address }))
}

async fn refresh_all_workers_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let workers = state.registry.refresh_all_workers().await;
    Json(serde_json::json!({ "workers": workers }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "workers": state.registry.worker_count().await,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    if !state.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}
