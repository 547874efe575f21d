//! Prometheus scrape endpoint.
//!
//! `GET /metrics` renders the shared [`MetricsState`]; `GET /health` answers
//! `ok` for liveness probes.

use crate::metrics::MetricsState;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router serving `state`.
pub fn router(state: Arc<MetricsState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<Arc<MetricsState>>) -> Response {
    match state.render() {
        Ok(body) => ([(header::CONTENT_TYPE, state.content_type())], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Serve scrapes on `listener` until `stop` flips to `true`.
///
/// In-flight requests are allowed to complete before this returns.
pub async fn serve(
    listener: TcpListener,
    state: Arc<MetricsState>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            // A dropped sender counts as a stop request too
            let _ = stop.wait_for(|stopped| *stopped).await;
            info!("metrics server shutting down");
        })
        .await
}
