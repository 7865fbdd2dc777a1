use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_indexer::db::{Action, BatchItem, DbError, SqlValue, Store};
use fleet_indexer::metrics::Metrics;
use fleet_indexer::model::{cluster_node_uid, EdgeKey, SyncResponse, INTER_CLUSTER_EDGE};
use fleet_indexer::server::limiter::RequestTracker;
use fleet_indexer::server::{build_router, AppState};

/// In-memory store that interprets queued statements, so handler round-trips
/// can assert on post-commit database state.
#[derive(Default)]
struct FakeStore {
    state: Mutex<FakeState>,
    fatal_message: Option<String>,
}

#[derive(Default)]
struct FakeState {
    // uid -> (cluster, data)
    resources: HashMap<String, (String, Value)>,
    // (sourceId, edgeType, destId) -> cluster
    edges: HashMap<(String, String, String), String>,
}

impl FakeStore {
    fn fatal(message: &str) -> Self {
        Self {
            fatal_message: Some(message.to_string()),
            ..Self::default()
        }
    }

    fn seed_resource(&self, uid: &str, cluster: &str) {
        self.state.lock().resources.insert(
            uid.to_string(),
            (cluster.to_string(), json!({"kind": "Pod", "name": uid})),
        );
    }

    fn seed_edge(&self, source: &str, edge_type: &str, dest: &str, cluster: &str) {
        self.state.lock().edges.insert(
            (source.to_string(), edge_type.to_string(), dest.to_string()),
            cluster.to_string(),
        );
    }

    fn resource_uids_snapshot(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.state.lock().resources.keys().cloned().collect();
        uids.sort();
        uids
    }
}

fn text(arg: &SqlValue) -> String {
    match arg {
        SqlValue::Text(value) => value.clone(),
        other => panic!("expected text argument, got {other:?}"),
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn exec_batch(&self, items: &[BatchItem]) -> Result<(), DbError> {
        if let Some(message) = &self.fatal_message {
            return Err(DbError::Database(message.clone()));
        }

        let mut state = self.state.lock();
        for item in items {
            match item.action {
                Action::AddResource | Action::BulkResources | Action::UpdateResource => {
                    for chunk in item.args.chunks(3) {
                        let data = match &chunk[2] {
                            SqlValue::Json(value) => value.clone(),
                            other => panic!("expected json argument, got {other:?}"),
                        };
                        state
                            .resources
                            .insert(text(&chunk[0]), (text(&chunk[1]), data));
                    }
                }
                Action::DeleteResource => match &item.args[0] {
                    SqlValue::Text(uid) => {
                        state.resources.remove(uid);
                    }
                    SqlValue::TextArray(uids) => {
                        for uid in uids {
                            state.resources.remove(uid);
                        }
                    }
                    other => panic!("expected text argument, got {other:?}"),
                },
                Action::AddEdge | Action::BulkInsertEdges => {
                    for chunk in item.args.chunks(6) {
                        state.edges.insert(
                            (text(&chunk[0]), text(&chunk[4]), text(&chunk[2])),
                            text(&chunk[5]),
                        );
                    }
                }
                Action::DeleteEdge => {
                    if item.query.contains(" IN (") {
                        for chunk in item.args.chunks(3) {
                            state.edges.remove(&(
                                text(&chunk[0]),
                                text(&chunk[1]),
                                text(&chunk[2]),
                            ));
                        }
                    } else {
                        // args are (sourceId, destId, edgeType)
                        state.edges.remove(&(
                            text(&item.args[0]),
                            text(&item.args[2]),
                            text(&item.args[1]),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn resource_uids(&self, cluster: &str) -> Result<Vec<String>, DbError> {
        let node_uid = cluster_node_uid(cluster);
        Ok(self
            .state
            .lock()
            .resources
            .iter()
            .filter(|(uid, (owner, _))| owner.as_str() == cluster && uid.as_str() != node_uid)
            .map(|(uid, _)| uid.clone())
            .collect())
    }

    async fn edge_keys(&self, cluster: &str) -> Result<Vec<EdgeKey>, DbError> {
        Ok(self
            .state
            .lock()
            .edges
            .iter()
            .filter(|((_, edge_type, _), owner)| {
                owner.as_str() == cluster && edge_type.as_str() != INTER_CLUSTER_EDGE
            })
            .map(|((source_id, edge_type, dest_id), _)| EdgeKey {
                source_id: source_id.clone(),
                edge_type: edge_type.clone(),
                dest_id: dest_id.clone(),
            })
            .collect())
    }

    async fn resource_count(&self, cluster: &str) -> Result<i64, DbError> {
        Ok(self
            .state
            .lock()
            .resources
            .values()
            .filter(|(owner, _)| owner.as_str() == cluster)
            .count() as i64)
    }

    async fn edge_count(&self, cluster: &str) -> Result<i64, DbError> {
        Ok(self
            .state
            .lock()
            .edges
            .iter()
            .filter(|((_, edge_type, _), owner)| {
                owner.as_str() == cluster && edge_type.as_str() != INTER_CLUSTER_EDGE
            })
            .count() as i64)
    }

    async fn cluster_node(&self, uid: &str) -> Result<Option<Value>, DbError> {
        Ok(self
            .state
            .lock()
            .resources
            .get(uid)
            .map(|(_, data)| data.clone()))
    }

    async fn upsert_cluster_node(&self, uid: &str, properties: &Value) -> Result<(), DbError> {
        self.state
            .lock()
            .resources
            .insert(uid.to_string(), (String::new(), properties.clone()));
        Ok(())
    }

    async fn delete_cluster_resources(&self, cluster: &str) -> Result<(u64, u64), DbError> {
        let mut state = self.state.lock();
        let before = state.resources.len();
        state
            .resources
            .retain(|_, (owner, _)| owner.as_str() != cluster);
        let resources = (before - state.resources.len()) as u64;

        let before = state.edges.len();
        state.edges.retain(|(_, edge_type, _), owner| {
            owner.as_str() != cluster || edge_type.as_str() == INTER_CLUSTER_EDGE
        });
        let edges = (before - state.edges.len()) as u64;
        Ok((resources, edges))
    }

    async fn delete_cluster_node(&self, uid: &str) -> Result<u64, DbError> {
        Ok(self.state.lock().resources.remove(uid).map_or(0, |_| 1))
    }
}

fn app_state(store: Arc<dyn Store>, request_limit: usize) -> AppState {
    AppState {
        store,
        tracker: Arc::new(RequestTracker::new(request_limit)),
        metrics: Arc::new(Metrics::new().unwrap()),
        batch_size: 500,
        request_timeout: Duration::from_secs(30),
        db_ready: Arc::new(AtomicBool::new(true)),
    }
}

async fn post_sync(router: &Router, cluster: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/aggregator/clusters/{cluster}/sync"))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn simple_payload() -> Value {
    json!({
        "clearAll": false,
        "addResources": (1..=5).map(|i| json!({
            "uid": format!("r{i}"),
            "properties": {"kind": "Pod", "name": format!("pod-{i}")}
        })).collect::<Vec<_>>(),
        "addEdges": [
            {"sourceId": "r1", "sourceKind": "Pod", "destId": "r2", "destKind": "ReplicaSet", "edgeType": "ownedBy"},
            {"sourceId": "r2", "sourceKind": "ReplicaSet", "destId": "r3", "destKind": "Deployment", "edgeType": "ownedBy"},
            {"sourceId": "r4", "sourceKind": "Pod", "destId": "r5", "destKind": "Node", "edgeType": "runsOn"}
        ]
    })
}

#[tokio::test]
async fn sync_request_reports_totals() {
    let store = Arc::new(FakeStore::default());
    let router = build_router(app_state(store.clone(), 50));

    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, response_body) = post_sync(&router, "test-cluster", body).await;

    assert_eq!(status, StatusCode::OK);
    let response: SyncResponse = serde_json::from_slice(&response_body).unwrap();
    // One bulk resource insert plus one bulk edge insert.
    assert_eq!(response.total_added, 2);
    assert_eq!(response.total_resources, 5);
    assert_eq!(response.total_edges, 3);
    assert!(response.add_errors.is_empty());

    let state = store.state.lock();
    assert_eq!(state.resources.get("r1").unwrap().0, "test-cluster");
    assert_eq!(state.resources.get("r1").unwrap().1["name"], "pod-1");
}

#[tokio::test]
async fn connection_fatal_error_returns_server_error() {
    let store = Arc::new(FakeStore::fatal("driver closed: unexpected EOF"));
    let router = build_router(app_state(store, 50));

    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, response_body) = post_sync(&router, "test-cluster", body).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        String::from_utf8(response_body).unwrap(),
        "Server error while processing the request.\n"
    );
}

#[tokio::test]
async fn resync_deletes_everything_missing_from_the_payload() {
    let store = Arc::new(FakeStore::default());
    for i in 1..=10 {
        store.seed_resource(&format!("old-{i}"), "test-cluster");
    }
    store.seed_edge("old-1", "ownedBy", "old-2", "test-cluster");
    store.seed_edge("old-3", "ownedBy", "old-4", "test-cluster");
    store.seed_edge("old-5", "runsOn", "old-6", "test-cluster");
    store.seed_edge("old-7", "runsOn", "old-8", "test-cluster");

    let router = build_router(app_state(store.clone(), 50));
    let mut payload = simple_payload();
    payload["clearAll"] = json!(true);

    let body = serde_json::to_vec(&payload).unwrap();
    let (status, response_body) = post_sync(&router, "test-cluster", body).await;

    assert_eq!(status, StatusCode::OK);
    let response: SyncResponse = serde_json::from_slice(&response_body).unwrap();
    // One statement deletes all stale resources, one all stale edges.
    assert_eq!(response.total_added, 2);
    assert_eq!(response.total_deleted, 1);
    assert_eq!(response.total_edges_deleted, 1);
    // Post-commit state is exactly the payload.
    assert_eq!(response.total_resources, 5);
    assert_eq!(response.total_edges, 3);
    assert_eq!(
        store.resource_uids_snapshot(),
        vec!["r1", "r2", "r3", "r4", "r5"]
    );
}

#[tokio::test]
async fn resubmitting_the_same_payload_is_idempotent() {
    let store = Arc::new(FakeStore::default());
    let router = build_router(app_state(store.clone(), 50));
    let body = serde_json::to_vec(&simple_payload()).unwrap();

    let (first_status, _) = post_sync(&router, "test-cluster", body.clone()).await;
    let state_after_first = store.resource_uids_snapshot();
    let (second_status, response_body) = post_sync(&router, "test-cluster", body).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(store.resource_uids_snapshot(), state_after_first);

    let response: SyncResponse = serde_json::from_slice(&response_body).unwrap();
    assert_eq!(response.total_resources, 5);
    assert!(response.add_errors.is_empty());
}

#[tokio::test]
async fn concurrent_request_for_the_same_cluster_is_rejected() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let state = app_state(store, 50);
    let router = build_router(state.clone());

    let _inflight = state.tracker.try_track("test-cluster").unwrap();
    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, response_body) = post_sync(&router, "test-cluster", body).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        String::from_utf8(response_body).unwrap(),
        "A previous request from this cluster is processing, retry later.\n"
    );
}

#[tokio::test]
async fn global_cap_rejects_remote_clusters_but_admits_local_cluster() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let state = app_state(store, 3);
    let router = build_router(state.clone());

    let _a = state.tracker.try_track("busy-1").unwrap();
    let _b = state.tracker.try_track("busy-2").unwrap();
    let _c = state.tracker.try_track("busy-3").unwrap();

    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, response_body) = post_sync(&router, "other-cluster", body.clone()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        String::from_utf8(response_body).unwrap(),
        "Indexer has too many pending requests, retry later.\n"
    );

    let (status, _) = post_sync(&router, "local-cluster", body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let router = build_router(app_state(store, 50));

    let body = b"This is an incorrect request body.".to_vec();
    let (status, _) = post_sync(&router, "test-cluster", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn limiter_entry_is_released_after_the_request() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let state = app_state(store, 50);
    let router = build_router(state.clone());

    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, _) = post_sync(&router, "test-cluster", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.tracker.inflight_count(), 0);

    // A bad request releases the entry too.
    let (status, _) = post_sync(&router, "test-cluster", b"not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(state.tracker.inflight_count(), 0);
}

#[tokio::test]
async fn probes_report_database_state() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let state = app_state(store, 50);
    let router = build_router(state.clone());

    let request = Request::builder()
        .uri("/liveness")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state
        .db_ready
        .store(false, std::sync::atomic::Ordering::Relaxed);
    let request = Request::builder()
        .uri("/readiness")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&bytes).contains("ReadinessProbe failed"));
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let router = build_router(app_state(store, 50));

    let body = serde_json::to_vec(&simple_payload()).unwrap();
    let (status, _) = post_sync(&router, "test-cluster", body).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let rendered = String::from_utf8_lossy(&bytes);
    assert!(rendered.contains("search_indexer_request_count"));
    assert!(rendered.contains("managed_cluster_name=\"test-cluster\""));
}
