//! Worker HTTP routes
//!
//! Streaming generation answers with a NUL-delimited sequence of JSON units;
//! every other route answers with plain JSON. The request id is returned in
//! the `x-request-id` header so a client can cancel through `/worker_abort`.

use crate::worker::ModelWorker;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use llmops_common::{LlmOpsError, Result, METRICS};
use llmops_proto::{
    AbortRequest, AbortResponse, ConvTemplateInfo, CountTokenRequest, CountTokenResponse,
    ErrorCode, GenerateParams, ModelDetails, WorkerStatus,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared handler state
#[derive(Clone)]
struct AppState {
    worker: Arc<ModelWorker>,
    enable_metrics: bool,
}

/// Build the worker router
pub fn build_router(worker: Arc<ModelWorker>, enable_metrics: bool) -> Router {
    let state = AppState {
        worker,
        enable_metrics,
    };

    Router::new()
        .route("/worker_generate_stream", post(generate_stream_handler))
        .route("/worker_generate", post(generate_handler))
        .route("/count_token", post(count_token_handler))
        .route("/worker_status", get(status_handler).post(status_handler))
        .route("/worker_conv_template", get(conv_template_handler).post(conv_template_handler))
        .route("/model_details", get(model_details_handler).post(model_details_handler))
        .route("/worker_abort", post(abort_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then drain open connections
pub async fn serve(
    worker: Arc<ModelWorker>,
    addr: SocketAddr,
    enable_metrics: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(worker, enable_metrics);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| LlmOpsError::config(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("Worker listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Worker HTTP server stopped");
    Ok(())
}

async fn generate_stream_handler(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> Result<Response> {
    let request = state.worker.generate_stream(&params).await?;
    let request_id = request.id().to_string();
    debug!(request_id = %request_id, "Streaming generation started");

    let request_id = HeaderValue::from_str(&request_id)
        .map_err(|e| LlmOpsError::internal(format!("invalid request id: {}", e)))?;

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (HeaderName::from_static(REQUEST_ID_HEADER), request_id),
        ],
        Body::from_stream(request.into_frames()),
    )
        .into_response())
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> Result<Response> {
    let request = state.worker.admit(&params).await?;
    let request_id = request.id().to_string();

    let mut response = match request.run_to_completion().await {
        Ok(unit) => Json(unit).into_response(),
        Err(e) => e.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

async fn count_token_handler(
    State(state): State<AppState>,
    Json(request): Json<CountTokenRequest>,
) -> Result<Json<CountTokenResponse>> {
    let count = state.worker.count_token(&request.prompt)?;
    Ok(Json(CountTokenResponse {
        count,
        error_code: ErrorCode::Ok.as_i32(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.worker.status())
}

async fn conv_template_handler(State(state): State<AppState>) -> Json<ConvTemplateInfo> {
    Json(state.worker.conv_template())
}

async fn model_details_handler(State(state): State<AppState>) -> Json<ModelDetails> {
    Json(state.worker.model_details())
}

async fn abort_handler(
    State(state): State<AppState>,
    Json(request): Json<AbortRequest>,
) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: state.worker.abort(&request.request_id),
    })
}

async fn health_handler(State(state): State<AppState>) -> Response {
    if state.worker.is_shutting_down() {
        LlmOpsError::Shutdown.into_response()
    } else {
        Json(serde_json::json!({
            "status": "ok",
            "worker_id": state.worker.identity().worker_id,
        }))
        .into_response()
    }
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
