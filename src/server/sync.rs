use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::batch::{ChangeRequest, EdgeRow, ResourceRow, SyncBatch, SyncSink};
use crate::config::COMPONENT_VERSION;
use crate::db::DbError;
use crate::model::{EdgeKey, SyncEvent, SyncResponse};
use crate::server::AppState;

const SERVER_ERROR_MESSAGE: &str = "Server error while processing the request.\n";

/// Applies one sync payload from a managed cluster and returns the summary
/// response. Per-row database errors are reported inside a `200` response;
/// only step-level failures produce a `500`.
pub async fn sync_resources(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    let event: SyncEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(cluster = %cluster, error = %err, "unable to decode sync request");
            observe(&state, "400", start, 0.0);
            return (StatusCode::BAD_REQUEST, "Unable to decode sync request.\n")
                .into_response();
        }
    };

    let changes = event.change_count() as f64;
    match process_sync(&state, &cluster, event).await {
        Ok(response) => {
            info!(
                cluster = %cluster,
                added = response.total_added,
                updated = response.total_updated,
                deleted = response.total_deleted,
                elapsed = ?start.elapsed(),
                "processed sync request"
            );
            observe(&state, "200", start, changes);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            error!(cluster = %cluster, error = %err, "sync request failed");
            observe(&state, "500", start, changes);
            (StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_MESSAGE).into_response()
        }
    }
}

fn observe(state: &AppState, code: &str, start: Instant, changes: f64) {
    state
        .metrics
        .request_duration
        .with_label_values(&[code])
        .observe(start.elapsed().as_secs_f64());
    state
        .metrics
        .request_size
        .with_label_values(&[code])
        .observe(changes);
}

async fn process_sync(
    state: &AppState,
    cluster: &str,
    event: SyncEvent,
) -> Result<SyncResponse, DbError> {
    let sink = Arc::new(SyncSink::default());
    let mut batch = SyncBatch::new(Arc::clone(&state.store), state.batch_size, Arc::clone(&sink));

    // Resync: read current state first, then enqueue deletions for anything
    // the payload no longer declares.
    if event.clear_all {
        let db_uids = state.store.resource_uids(cluster).await?;
        let db_edges = state.store.edge_keys(cluster).await?;
        let plan = plan_resync_deletes(&db_uids, &db_edges, &event);
        info!(
            cluster = %cluster,
            stale_resources = plan.stale_uids.len(),
            stale_edges = plan.stale_edges.len(),
            "reconciling full resync"
        );
        if !plan.stale_uids.is_empty() {
            batch.queue(ChangeRequest::DeleteResources {
                uids: plan.stale_uids,
            })?;
        }
        if !plan.stale_edges.is_empty() {
            batch.queue(ChangeRequest::DeleteEdges {
                keys: plan.stale_edges,
            })?;
        }
    }

    for delete in &event.delete_resources {
        batch.queue(ChangeRequest::DeleteResource {
            uid: delete.uid.clone(),
        })?;
    }
    for edge in &event.delete_edges {
        batch.queue(ChangeRequest::DeleteEdge {
            source_id: edge.source_id.clone(),
            dest_id: edge.dest_id.clone(),
            edge_type: edge.edge_type.clone(),
        })?;
    }

    // A uid listed under both adds and updates is applied as update only.
    let update_uids: HashSet<&str> = event
        .update_resources
        .iter()
        .map(|change| change.uid.as_str())
        .collect();
    for change in &event.add_resources {
        if update_uids.contains(change.uid.as_str()) {
            continue;
        }
        batch.queue(ChangeRequest::AddResource(ResourceRow {
            uid: change.uid.clone(),
            cluster: cluster.to_string(),
            data: Value::Object(change.properties.clone()),
        }))?;
    }
    for change in &event.update_resources {
        batch.queue(ChangeRequest::UpdateResource {
            uid: change.uid.clone(),
            cluster: cluster.to_string(),
            data: Value::Object(change.properties.clone()),
        })?;
    }
    for edge in &event.add_edges {
        batch.queue(ChangeRequest::AddEdge(EdgeRow {
            source_id: edge.source_id.clone(),
            source_kind: edge.source_kind.clone(),
            dest_id: edge.dest_id.clone(),
            dest_kind: edge.dest_kind.clone(),
            edge_type: edge.edge_type.clone(),
            cluster: cluster.to_string(),
        }))?;
    }

    batch.finish().await?;

    let total_resources = state.store.resource_count(cluster).await?;
    let total_edges = state.store.edge_count(cluster).await?;

    let mut response = SyncResponse {
        version: COMPONENT_VERSION.to_string(),
        total_resources: total_resources.max(0) as u64,
        total_edges: total_edges.max(0) as u64,
        ..Default::default()
    };
    sink.apply_to(&mut response);
    Ok(response)
}

pub(crate) struct ResyncPlan {
    pub stale_uids: Vec<String>,
    pub stale_edges: Vec<EdgeKey>,
}

/// Computes what a full resync must delete: rows and edges present in the
/// database but absent from the payload. The cluster-node row and
/// inter-cluster edges are already excluded by the read queries.
pub(crate) fn plan_resync_deletes(
    db_uids: &[String],
    db_edges: &[EdgeKey],
    event: &SyncEvent,
) -> ResyncPlan {
    let keep_uids: HashSet<&str> = event
        .add_resources
        .iter()
        .chain(event.update_resources.iter())
        .map(|change| change.uid.as_str())
        .collect();
    let stale_uids = db_uids
        .iter()
        .filter(|uid| !keep_uids.contains(uid.as_str()))
        .cloned()
        .collect();

    let keep_edges: HashSet<(&str, &str, &str)> = event
        .add_edges
        .iter()
        .map(|edge| {
            (
                edge.source_id.as_str(),
                edge.edge_type.as_str(),
                edge.dest_id.as_str(),
            )
        })
        .collect();
    let stale_edges = db_edges
        .iter()
        .filter(|key| {
            !keep_edges.contains(&(
                key.source_id.as_str(),
                key.edge_type.as_str(),
                key.dest_id.as_str(),
            ))
        })
        .cloned()
        .collect();

    ResyncPlan {
        stale_uids,
        stale_edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeChange, ResourceChange};
    use serde_json::Map;

    fn change(uid: &str) -> ResourceChange {
        ResourceChange {
            uid: uid.to_string(),
            properties: Map::new(),
        }
    }

    fn edge_key(source: &str, dest: &str) -> EdgeKey {
        EdgeKey {
            source_id: source.to_string(),
            edge_type: "ownedBy".to_string(),
            dest_id: dest.to_string(),
        }
    }

    #[test]
    fn resync_deletes_rows_missing_from_the_payload() {
        let db_uids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let db_edges = vec![edge_key("a", "b"), edge_key("b", "c")];
        let event = SyncEvent {
            clear_all: true,
            add_resources: vec![change("a")],
            update_resources: vec![change("b")],
            add_edges: vec![EdgeChange {
                source_id: "a".into(),
                source_kind: "Pod".into(),
                dest_id: "b".into(),
                dest_kind: "ReplicaSet".into(),
                edge_type: "ownedBy".into(),
            }],
            ..Default::default()
        };

        let plan = plan_resync_deletes(&db_uids, &db_edges, &event);
        assert_eq!(plan.stale_uids, vec!["c".to_string()]);
        assert_eq!(plan.stale_edges, vec![edge_key("b", "c")]);
    }

    #[test]
    fn empty_resync_payload_deletes_everything() {
        let db_uids: Vec<String> = vec!["a".into(), "b".into()];
        let db_edges = vec![edge_key("a", "b")];
        let event = SyncEvent {
            clear_all: true,
            ..Default::default()
        };

        let plan = plan_resync_deletes(&db_uids, &db_edges, &event);
        assert_eq!(plan.stale_uids.len(), 2);
        assert_eq!(plan.stale_edges.len(), 1);
    }
}
