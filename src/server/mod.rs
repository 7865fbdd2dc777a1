pub mod limiter;
pub mod probes;
pub mod sync;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::Store;
use crate::metrics::Metrics;
use crate::server::limiter::RequestTracker;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub tracker: Arc<RequestTracker>,
    pub metrics: Arc<Metrics>,
    pub batch_size: usize,
    pub request_timeout: Duration,
    pub db_ready: Arc<AtomicBool>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/aggregator/clusters/:id/sync",
            post(sync::sync_resources).route_layer(middleware::from_fn_with_state(
                state.clone(),
                limiter::limit_cluster_requests,
            )),
        )
        .route("/liveness", get(probes::liveness))
        .route("/readiness", get(probes::readiness))
        .route("/metrics", get(serve_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_request_timeout,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn serve_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn enforce_request_timeout(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(state.request_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

/// Resolves once SIGINT or SIGTERM arrives, then cancels the cluster watch
/// so the informers stop queueing writes while in-flight requests drain.
/// A handler that cannot be installed falls back to waiting forever; the
/// remaining signal still triggers shutdown.
pub async fn shutdown_signal(lifecycle: CancellationToken) {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, stopping cluster watch");
    lifecycle.cancel();
}
