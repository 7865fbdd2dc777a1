use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde_json::Value;

/// Last-known properties for a cluster node, with the time they were written.
/// The timestamp lets operators audit how stale a merged property set is.
#[derive(Debug, Clone)]
pub struct CachedCluster {
    pub properties: Value,
    pub refreshed_at: SystemTime,
}

/// Process-wide mirror of cluster-node rows, keyed by cluster-node uid.
/// Authoritative for "have we seen this cluster already" and for deciding
/// whether an upsert would be a no-op.
#[derive(Debug, Default)]
pub struct ClusterCache {
    inner: RwLock<HashMap<String, CachedCluster>>,
}

impl ClusterCache {
    pub fn read(&self, uid: &str) -> Option<Value> {
        self.inner.read().get(uid).map(|c| c.properties.clone())
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.inner.read().contains_key(uid)
    }

    pub fn update(&self, uid: &str, properties: Value) {
        self.inner.write().insert(
            uid.to_string(),
            CachedCluster {
                properties,
                refreshed_at: SystemTime::now(),
            },
        );
    }

    pub fn delete(&self, uid: &str) {
        self.inner.write().remove(uid);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
