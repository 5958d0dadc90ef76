//! Status endpoint
//!
//! Health, readiness and counter snapshot over HTTP for external monitoring.
//! None of these routes require authentication.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectorHandle, CountersSnapshot};

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

/// Counter snapshot response
#[derive(Debug, Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    #[serde(flatten)]
    counters: CountersSnapshot,
}

/// Serve the status endpoint until `cancel` fires
///
/// The listener is bound by the caller so tests and the binary can both pick
/// the port.
pub async fn serve(
    listener: TcpListener,
    handle: CollectorHandle,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(handle);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "status endpoint listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health_handler(State(handle): State<CollectorHandle>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: handle.uptime_secs(),
    })
}

async fn ready_handler(State(handle): State<CollectorHandle>) -> impl IntoResponse {
    if handle.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn status_handler(State(handle): State<CollectorHandle>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_secs: handle.uptime_secs(),
        counters: handle.snapshot(),
    })
}
