use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::warn;

use crate::server::AppState;

/// The hub's own cluster is exempt from the global cap so it is never starved
/// by remote traffic.
pub const LOCAL_CLUSTER: &str = "local-cluster";

const CLUSTER_BUSY_MESSAGE: &str =
    "A previous request from this cluster is processing, retry later.\n";
const TOO_MANY_REQUESTS_MESSAGE: &str = "Indexer has too many pending requests, retry later.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ClusterBusy,
    TooManyRequests,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::ClusterBusy => CLUSTER_BUSY_MESSAGE,
            Rejection::TooManyRequests => TOO_MANY_REQUESTS_MESSAGE,
        }
    }
}

/// Tracks the in-flight sync request per cluster: at most one per cluster,
/// and at most `limit` across all clusters.
#[derive(Debug)]
pub struct RequestTracker {
    inflight: RwLock<HashMap<String, Instant>>,
    limit: usize,
}

impl RequestTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            inflight: RwLock::new(HashMap::new()),
            limit,
        }
    }

    /// Admits the request or rejects it. The returned guard removes the
    /// tracker entry when dropped, so release happens on every exit path.
    pub fn try_track(self: &Arc<Self>, cluster: &str) -> Result<TrackedRequest, Rejection> {
        let mut inflight = self.inflight.write();

        if let Some(received) = inflight.get(cluster) {
            warn!(
                cluster = %cluster,
                inflight_for = ?received.elapsed(),
                "rejecting request; a previous request from this cluster is still processing"
            );
            return Err(Rejection::ClusterBusy);
        }

        if inflight.len() >= self.limit && cluster != LOCAL_CLUSTER {
            warn!(
                pending = inflight.len(),
                cluster = %cluster,
                "too many pending requests, rejecting sync"
            );
            return Err(Rejection::TooManyRequests);
        }

        inflight.insert(cluster.to_string(), Instant::now());
        Ok(TrackedRequest {
            tracker: Arc::clone(self),
            cluster: cluster.to_string(),
        })
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.read().len()
    }

    fn release(&self, cluster: &str) {
        self.inflight.write().remove(cluster);
    }
}

#[derive(Debug)]
pub struct TrackedRequest {
    tracker: Arc<RequestTracker>,
    cluster: String,
}

impl Drop for TrackedRequest {
    fn drop(&mut self) {
        self.tracker.release(&self.cluster);
    }
}

pub async fn limit_cluster_requests(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request,
    next: Next,
) -> Response {
    state
        .metrics
        .request_count
        .with_label_values(&[cluster.as_str()])
        .inc();

    match state.tracker.try_track(&cluster) {
        Ok(_tracked) => next.run(request).await,
        Err(rejection) => {
            (StatusCode::TOO_MANY_REQUESTS, rejection.message()).into_response()
        }
    }
}
