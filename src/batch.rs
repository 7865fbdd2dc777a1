//! Batched statement execution with retry isolation.
//!
//! Queued changes accumulate until `batch_size` statements are pending, then
//! the snapshot is dispatched to a worker as one transaction. Homogeneous row
//! inserts are grouped into multi-value statements before dispatch. When a
//! snapshot fails, it is split in half and re-sent recursively until the
//! offending statement is isolated and reported, so one bad row never poisons
//! the rest of the request.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::db::{Action, BatchItem, DbError, SqlValue, Store};
use crate::model::{EdgeKey, SyncError, SyncResponse};

const ROW_ERROR_MESSAGE: &str = "Resource generated an error while updating the database.";

/// A resource row bound for the resources table.
#[derive(Debug, Clone)]
pub struct ResourceRow {
    pub uid: String,
    pub cluster: String,
    pub data: Value,
}

/// An edge row bound for the edges table.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub source_id: String,
    pub source_kind: String,
    pub dest_id: String,
    pub dest_kind: String,
    pub edge_type: String,
    pub cluster: String,
}

/// One change request queued by the sync handler.
#[derive(Debug, Clone)]
pub enum ChangeRequest {
    AddResource(ResourceRow),
    UpdateResource {
        uid: String,
        cluster: String,
        data: Value,
    },
    DeleteResource {
        uid: String,
    },
    /// Resync reconciliation: all stale uids removed by one statement.
    DeleteResources {
        uids: Vec<String>,
    },
    AddEdge(EdgeRow),
    DeleteEdge {
        source_id: String,
        dest_id: String,
        edge_type: String,
    },
    /// Resync reconciliation: all stale edge keys removed by one statement.
    DeleteEdges {
        keys: Vec<EdgeKey>,
    },
}

/// Collects per-action success counts and per-row errors from concurrently
/// dispatched workers. Applied to the response once the batch has drained.
#[derive(Debug, Default)]
pub struct SyncSink {
    inner: Mutex<SinkState>,
}

#[derive(Debug, Default)]
struct SinkState {
    added: u64,
    updated: u64,
    deleted: u64,
    edges_deleted: u64,
    add_errors: Vec<SyncError>,
    update_errors: Vec<SyncError>,
    delete_errors: Vec<SyncError>,
    add_edge_errors: Vec<SyncError>,
    delete_edge_errors: Vec<SyncError>,
}

impl SyncSink {
    fn record_success(&self, items: &[BatchItem]) {
        let mut state = self.inner.lock();
        for item in items {
            match item.action {
                Action::AddResource
                | Action::BulkResources
                | Action::AddEdge
                | Action::BulkInsertEdges => state.added += 1,
                Action::UpdateResource => state.updated += 1,
                Action::DeleteResource => state.deleted += 1,
                Action::DeleteEdge => state.edges_deleted += 1,
            }
        }
    }

    fn record_error(&self, item: &BatchItem) {
        let sync_error = SyncError {
            resource_uid: item.uid.clone(),
            message: ROW_ERROR_MESSAGE.to_string(),
        };
        let mut state = self.inner.lock();
        match item.action {
            Action::AddResource | Action::BulkResources => state.add_errors.push(sync_error),
            Action::UpdateResource => state.update_errors.push(sync_error),
            Action::DeleteResource => state.delete_errors.push(sync_error),
            Action::AddEdge | Action::BulkInsertEdges => state.add_edge_errors.push(sync_error),
            Action::DeleteEdge => state.delete_edge_errors.push(sync_error),
        }
    }

    /// Moves the accumulated counts and errors into the response.
    pub fn apply_to(&self, response: &mut SyncResponse) {
        let mut state = self.inner.lock();
        response.total_added = state.added;
        response.total_updated = state.updated;
        response.total_deleted = state.deleted;
        response.total_edges_deleted = state.edges_deleted;
        response.add_errors = std::mem::take(&mut state.add_errors);
        response.update_errors = std::mem::take(&mut state.update_errors);
        response.delete_errors = std::mem::take(&mut state.delete_errors);
        response.add_edge_errors = std::mem::take(&mut state.add_edge_errors);
        response.delete_edge_errors = std::mem::take(&mut state.delete_edge_errors);
    }
}

/// Per-request batch of statements. Not shared across requests.
pub struct SyncBatch {
    store: Arc<dyn Store>,
    batch_size: usize,
    items: Vec<BatchItem>,
    resource_insert_q: Vec<ResourceRow>,
    edge_insert_q: Vec<EdgeRow>,
    sink: Arc<SyncSink>,
    tasks: JoinSet<()>,
    conn_error: Arc<OnceCell<String>>,
}

impl SyncBatch {
    pub fn new(store: Arc<dyn Store>, batch_size: usize, sink: Arc<SyncSink>) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            items: Vec::new(),
            resource_insert_q: Vec::new(),
            edge_insert_q: Vec::new(),
            sink,
            tasks: JoinSet::new(),
            conn_error: Arc::new(OnceCell::new()),
        }
    }

    /// Queues a change and dispatches a snapshot once enough statements are
    /// pending. Fails fast after a worker has observed a connection-fatal
    /// error.
    pub fn queue(&mut self, change: ChangeRequest) -> Result<(), DbError> {
        if let Some(message) = self.conn_error.get() {
            return Err(DbError::Database(message.clone()));
        }

        match change {
            ChangeRequest::AddResource(row) => {
                self.resource_insert_q.push(row);
                if self.resource_insert_q.len() >= self.batch_size {
                    let rows = std::mem::take(&mut self.resource_insert_q);
                    self.items.push(bulk_resources_item(rows));
                }
            }
            ChangeRequest::AddEdge(row) => {
                self.edge_insert_q.push(row);
                if self.edge_insert_q.len() >= self.batch_size {
                    let rows = std::mem::take(&mut self.edge_insert_q);
                    self.items.push(bulk_edges_item(rows));
                }
            }
            other => self.items.push(statement_for(other)),
        }

        if self.items.len() >= self.batch_size {
            let snapshot = std::mem::take(&mut self.items);
            self.dispatch(snapshot);
        }
        Ok(())
    }

    /// Materializes residual inserts, dispatches the final snapshot, and
    /// waits for every in-flight worker. Returns the connection-fatal error
    /// if any worker hit one.
    pub async fn finish(mut self) -> Result<(), DbError> {
        if !self.resource_insert_q.is_empty() {
            let rows = std::mem::take(&mut self.resource_insert_q);
            self.items.push(bulk_resources_item(rows));
        }
        if !self.edge_insert_q.is_empty() {
            let rows = std::mem::take(&mut self.edge_insert_q);
            self.items.push(bulk_edges_item(rows));
        }
        if !self.items.is_empty() {
            let snapshot = std::mem::take(&mut self.items);
            self.dispatch(snapshot);
        }

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "batch worker task failed");
            }
        }

        if let Some(message) = self.conn_error.get() {
            return Err(DbError::Database(message.clone()));
        }
        Ok(())
    }

    fn dispatch(&mut self, snapshot: Vec<BatchItem>) {
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let conn_error = Arc::clone(&self.conn_error);
        self.tasks.spawn(async move {
            // Failures are recorded through the sink or conn_error.
            let _ = send_with_retry(store, snapshot, sink, conn_error).await;
        });
    }
}

/// Sends a snapshot as one transaction. On failure, splits the snapshot in
/// half and recurses until the offending statement is isolated; the isolated
/// row error goes to the sink and is terminal for that row. Connection-fatal
/// errors poison the whole batch instead of recursing.
fn send_with_retry(
    store: Arc<dyn Store>,
    mut items: Vec<BatchItem>,
    sink: Arc<SyncSink>,
    conn_error: Arc<OnceCell<String>>,
) -> BoxFuture<'static, Result<(), DbError>> {
    Box::pin(async move {
        let start = Instant::now();
        match store.exec_batch(&items).await {
            Ok(()) => {
                sink.record_success(&items);
                debug!(
                    statements = items.len(),
                    elapsed = ?start.elapsed(),
                    "processed batch"
                );
                Ok(())
            }
            Err(err) if err.is_connection_fatal() => {
                error!("send batch failed because the database is unavailable, not retrying");
                let _ = conn_error.set(err.to_string());
                Err(err)
            }
            Err(err @ DbError::Cancelled(_)) => Err(err),
            Err(err) => {
                if items.len() == 1 {
                    if let Some(item) = items.pop() {
                        warn!(
                            action = ?item.action,
                            uid = %item.uid,
                            error = %err,
                            "statement rejected by the database"
                        );
                        sink.record_error(&item);
                    }
                    // The error is reported; stop the recursion here.
                    return Ok(());
                }

                let right = items.split_off(items.len() / 2);
                let left_result = send_with_retry(
                    Arc::clone(&store),
                    items,
                    Arc::clone(&sink),
                    Arc::clone(&conn_error),
                )
                .await;
                let right_result = send_with_retry(store, right, sink, conn_error).await;

                if left_result.is_ok() || right_result.is_ok() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    })
}

fn statement_for(change: ChangeRequest) -> BatchItem {
    match change {
        ChangeRequest::UpdateResource { uid, cluster, data } => BatchItem {
            action: Action::UpdateResource,
            query: "INSERT INTO search.resources (uid, cluster, data) VALUES ($1, $2, $3) \
                    ON CONFLICT (uid) DO UPDATE SET cluster = EXCLUDED.cluster, data = EXCLUDED.data"
                .to_string(),
            args: vec![
                SqlValue::Text(uid.clone()),
                SqlValue::Text(cluster),
                SqlValue::Json(data),
            ],
            uid,
        },
        ChangeRequest::DeleteResource { uid } => BatchItem {
            action: Action::DeleteResource,
            query: "DELETE FROM search.resources WHERE uid = $1".to_string(),
            args: vec![SqlValue::Text(uid.clone())],
            uid,
        },
        ChangeRequest::DeleteResources { uids } => BatchItem {
            action: Action::DeleteResource,
            uid: String::new(),
            query: "DELETE FROM search.resources WHERE uid = ANY($1)".to_string(),
            args: vec![SqlValue::TextArray(uids)],
        },
        ChangeRequest::DeleteEdge {
            source_id,
            dest_id,
            edge_type,
        } => BatchItem {
            action: Action::DeleteEdge,
            uid: source_id.clone(),
            query: "DELETE FROM search.edges WHERE sourceId = $1 AND destId = $2 AND edgeType = $3"
                .to_string(),
            args: vec![
                SqlValue::Text(source_id),
                SqlValue::Text(dest_id),
                SqlValue::Text(edge_type),
            ],
        },
        ChangeRequest::DeleteEdges { keys } => bulk_edge_delete_item(keys),
        // Row inserts are grouped in queue() and never reach here.
        ChangeRequest::AddResource(row) => bulk_resources_item(vec![row]),
        ChangeRequest::AddEdge(row) => bulk_edges_item(vec![row]),
    }
}

fn bulk_resources_item(rows: Vec<ResourceRow>) -> BatchItem {
    let mut query = String::from("INSERT INTO search.resources (uid, cluster, data) VALUES ");
    let mut args = Vec::with_capacity(rows.len() * 3);
    for (index, row) in rows.into_iter().enumerate() {
        if index > 0 {
            query.push(',');
        }
        let base = index * 3;
        query.push_str(&format!("(${},${},${})", base + 1, base + 2, base + 3));
        args.push(SqlValue::Text(row.uid));
        args.push(SqlValue::Text(row.cluster));
        args.push(SqlValue::Json(row.data));
    }
    query.push_str(" ON CONFLICT (uid) DO UPDATE SET cluster = EXCLUDED.cluster, data = EXCLUDED.data");
    BatchItem {
        action: Action::BulkResources,
        uid: String::new(),
        query,
        args,
    }
}

fn bulk_edges_item(rows: Vec<EdgeRow>) -> BatchItem {
    let mut query = String::from(
        "INSERT INTO search.edges (sourceId, sourceKind, destId, destKind, edgeType, cluster) VALUES ",
    );
    let mut args = Vec::with_capacity(rows.len() * 6);
    for (index, row) in rows.into_iter().enumerate() {
        if index > 0 {
            query.push(',');
        }
        let base = index * 6;
        query.push_str(&format!(
            "(${},${},${},${},${},${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6
        ));
        args.push(SqlValue::Text(row.source_id));
        args.push(SqlValue::Text(row.source_kind));
        args.push(SqlValue::Text(row.dest_id));
        args.push(SqlValue::Text(row.dest_kind));
        args.push(SqlValue::Text(row.edge_type));
        args.push(SqlValue::Text(row.cluster));
    }
    query.push_str(" ON CONFLICT (sourceId, destId, edgeType) DO NOTHING");
    BatchItem {
        action: Action::BulkInsertEdges,
        uid: String::new(),
        query,
        args,
    }
}

fn bulk_edge_delete_item(keys: Vec<EdgeKey>) -> BatchItem {
    let mut query = String::from("DELETE FROM search.edges WHERE (sourceId, edgeType, destId) IN (");
    let mut args = Vec::with_capacity(keys.len() * 3);
    for (index, key) in keys.into_iter().enumerate() {
        if index > 0 {
            query.push(',');
        }
        let base = index * 3;
        query.push_str(&format!("(${},${},${})", base + 1, base + 2, base + 3));
        args.push(SqlValue::Text(key.source_id));
        args.push(SqlValue::Text(key.edge_type));
        args.push(SqlValue::Text(key.dest_id));
    }
    query.push(')');
    BatchItem {
        action: Action::DeleteEdge,
        uid: String::new(),
        query,
        args,
    }
}
