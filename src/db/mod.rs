pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::EdgeKey;

/// Error text fragments that indicate the database connection itself is gone.
/// A batch that fails this way is not retried; the engine is poisoned and the
/// request fails as a whole.
const CONNECTION_FATAL_PATTERNS: [&str; 3] =
    ["unexpected EOF", "failed to connect", "pool timed out"];

#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl DbError {
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            DbError::Database(message) => CONNECTION_FATAL_PATTERNS
                .iter()
                .any(|pattern| message.contains(pattern)),
            DbError::Cancelled(_) => false,
        }
    }
}

pub(crate) fn to_db_error(err: sqlx::Error) -> DbError {
    DbError::Database(err.to_string())
}

/// Statement action, used to attribute success counts and per-row errors to
/// the matching response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AddResource,
    UpdateResource,
    DeleteResource,
    AddEdge,
    DeleteEdge,
    BulkResources,
    BulkInsertEdges,
}

/// Typed bind parameter for a batch statement.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
}

/// One SQL statement queued for batched execution. `uid` identifies the
/// originating row when a single-statement failure is reported; bulk
/// statements carry an empty uid.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub action: Action,
    pub uid: String,
    pub query: String,
    pub args: Vec<SqlValue>,
}

/// Database operations needed by the sync pipeline and the cluster lifecycle
/// subsystem. Constructed once and passed into the handlers; tests substitute
/// a fake.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Executes all statements in one transaction. Either every statement
    /// commits or none does, which is what makes a failing batch bisectable.
    async fn exec_batch(&self, items: &[BatchItem]) -> Result<(), DbError>;

    /// All resource uids stored for the cluster, excluding its cluster-node row.
    async fn resource_uids(&self, cluster: &str) -> Result<Vec<String>, DbError>;

    /// All edge keys stored for the cluster, excluding inter-cluster edges.
    async fn edge_keys(&self, cluster: &str) -> Result<Vec<EdgeKey>, DbError>;

    async fn resource_count(&self, cluster: &str) -> Result<i64, DbError>;

    /// Edge count for the cluster, excluding inter-cluster edges.
    async fn edge_count(&self, cluster: &str) -> Result<i64, DbError>;

    /// The `data` column of a cluster-node row, if present.
    async fn cluster_node(&self, uid: &str) -> Result<Option<Value>, DbError>;

    async fn upsert_cluster_node(&self, uid: &str, properties: &Value) -> Result<(), DbError>;

    /// Deletes the cluster's resources and non-inter-cluster edges in one
    /// transaction. Returns (resources deleted, edges deleted).
    async fn delete_cluster_resources(&self, cluster: &str) -> Result<(u64, u64), DbError>;

    /// Deletes the cluster-node row. A single statement, not transactional.
    async fn delete_cluster_node(&self, uid: &str) -> Result<u64, DbError>;
}
