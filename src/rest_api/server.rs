//! Axum HTTP server for metrics and health probes

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::controller::{metrics, ControllerState};
use crate::error::{Error, Result};

/// Metrics endpoint handler
async fn metrics_handler() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    match encode(&mut buffer, &metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Liveness: the process is serving
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness: the indexes completed their initial list
async fn readyz(State(state): State<Arc<ControllerState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

/// Routes served by the operator
pub fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
