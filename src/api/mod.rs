use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::{JobSnapshot, MetricsRegistry, Scheduler, TriggerOutcome};
use crate::shutdown::cancel_after;

/// Delay between a shutdown request and cancelling the process token, so the
/// response reaches the caller first.
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<MetricsRegistry>,
    pub shutdown: CancellationToken,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

fn message(status: StatusCode, message: &'static str) -> (StatusCode, Json<MessageResponse>) {
    (status, Json(MessageResponse { message }))
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/jobs", get(list_jobs_handler))
        .route("/api/v1/jobs/:name", post(trigger_job_handler))
        .route("/metrics", get(metrics_handler))
        .route("/mgmt/shutdown", get(shutdown_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the shutdown token is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Json<Vec<JobSnapshot>> {
    Json(state.scheduler.jobs())
}

async fn trigger_job_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.trigger(&name) {
        TriggerOutcome::Created => message(StatusCode::CREATED, "job created"),
        TriggerOutcome::Conflict => message(StatusCode::CONFLICT, "job in progress"),
        TriggerOutcome::NotFound => message(StatusCode::NOT_FOUND, "job not found"),
    }
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn shutdown_handler(State(state): State<ApiState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested over HTTP");
    cancel_after(state.shutdown.clone(), SHUTDOWN_DELAY);
    message(StatusCode::OK, "shutting down")
}
