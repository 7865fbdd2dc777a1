use std::sync::atomic::Ordering;

use axum::extract::State;

use crate::server::AppState;

pub async fn liveness() -> &'static str {
    "OK"
}

pub async fn readiness(State(state): State<AppState>) -> &'static str {
    if !state.db_ready.load(Ordering::Relaxed) {
        return "ReadinessProbe failed with error: database not initialized";
    }
    "OK"
}
