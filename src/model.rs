use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix for the sentinel resource row that represents a managed cluster
/// itself. The row for cluster `C` has uid `cluster__C` and an empty
/// `cluster` column.
pub const CLUSTER_UID_PREFIX: &str = "cluster__";

/// Edge type that marks cross-cluster edges. These are excluded from
/// per-cluster cascade deletes and per-cluster edge counts.
pub const INTER_CLUSTER_EDGE: &str = "interCluster";

pub fn cluster_node_uid(cluster: &str) -> String {
    format!("{CLUSTER_UID_PREFIX}{cluster}")
}

/// Incremental or full-resync payload posted by a managed cluster's collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(default)]
    pub clear_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub add_resources: Vec<ResourceChange>,
    #[serde(default)]
    pub update_resources: Vec<ResourceChange>,
    #[serde(default)]
    pub delete_resources: Vec<ResourceDelete>,
    #[serde(default)]
    pub add_edges: Vec<EdgeChange>,
    #[serde(default)]
    pub delete_edges: Vec<EdgeChange>,
}

impl SyncEvent {
    /// Total number of changes carried by this payload.
    pub fn change_count(&self) -> usize {
        self.add_resources.len()
            + self.update_resources.len()
            + self.delete_resources.len()
            + self.add_edges.len()
            + self.delete_edges.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub uid: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDelete {
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeChange {
    pub source_id: String,
    #[serde(default)]
    pub source_kind: String,
    pub dest_id: String,
    #[serde(default)]
    pub dest_kind: String,
    pub edge_type: String,
}

/// The `(sourceId, edgeType, destId)` triple that identifies an edge row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub source_id: String,
    pub edge_type: String,
    pub dest_id: String,
}

/// Per-request summary returned to the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub version: String,
    #[serde(default)]
    pub total_added: u64,
    #[serde(default)]
    pub total_updated: u64,
    #[serde(default)]
    pub total_deleted: u64,
    #[serde(default)]
    pub total_resources: u64,
    #[serde(default)]
    pub total_edges: u64,
    #[serde(default)]
    pub total_edges_deleted: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_errors: Vec<SyncError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_errors: Vec<SyncError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_errors: Vec<SyncError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_edge_errors: Vec<SyncError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_edge_errors: Vec<SyncError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(rename = "resourceUID")]
    pub resource_uid: String,
    pub message: String,
}

/// Typed projection of a control-plane object. Informer objects are nested
/// free-form maps; they are projected into this struct at the boundary so
/// untyped values never reach the database layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub uid: String,
    pub kind: String,
    pub properties: Map<String, Value>,
}
