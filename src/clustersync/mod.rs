//! Cluster lifecycle: watches control-plane cluster objects and keeps the
//! cluster-node rows and the cluster cache in sync with the fleet.

pub mod transform;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ClusterCache;
use crate::db::{DbError, Store};
use crate::model::{cluster_node_uid, Resource};

/// Addon whose removal means the cluster stopped reporting and its data
/// should be cleared.
pub const SEARCH_COLLECTOR_ADDON: &str = "search-collector";

/// A control-plane kind watched by the lifecycle subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl WatchedKind {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

pub const MANAGED_CLUSTER: WatchedKind = WatchedKind {
    group: "cluster.open-cluster-management.io",
    version: "v1",
    kind: "ManagedCluster",
    plural: "managedclusters",
};

pub const MANAGED_CLUSTER_INFO: WatchedKind = WatchedKind {
    group: "internal.open-cluster-management.io",
    version: "v1beta1",
    kind: "ManagedClusterInfo",
    plural: "managedclusterinfos",
};

pub const MANAGED_CLUSTER_ADDON: WatchedKind = WatchedKind {
    group: "addon.open-cluster-management.io",
    version: "v1alpha1",
    kind: "ManagedClusterAddOn",
    plural: "managedclusteraddons",
};

/// Retry bounds for cascade-delete transactions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::from_millis(500),
            cap,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        (self.base * attempt).min(self.cap)
    }
}

pub struct ClusterSyncer {
    store: Arc<dyn Store>,
    cache: Arc<ClusterCache>,
    retry: RetryPolicy,
    // Both informers can deliver the same cluster concurrently; one upsert
    // at a time eliminates double-insert races.
    upsert_lock: tokio::sync::Mutex<()>,
}

impl ClusterSyncer {
    pub fn new(store: Arc<dyn Store>, cache: Arc<ClusterCache>, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            retry,
            upsert_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Runs one informer supervisor per watched kind until cancelled.
    pub async fn run(
        self: Arc<Self>,
        client: Client,
        rediscover_rate: Duration,
        token: CancellationToken,
    ) {
        info!("begin cluster watch");
        let mut tasks = JoinSet::new();
        for kind in [&MANAGED_CLUSTER, &MANAGED_CLUSTER_INFO, &MANAGED_CLUSTER_ADDON] {
            tasks.spawn(Arc::clone(&self).supervise(
                client.clone(),
                kind,
                rediscover_rate,
                token.child_token(),
            ));
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "informer supervisor task failed");
            }
        }
        info!("cluster watch stopped");
    }

    /// Starts the informer while the group/version is served, stops it when
    /// the resource vanishes, and restarts it when it reappears.
    async fn supervise(
        self: Arc<Self>,
        client: Client,
        kind: &'static WatchedKind,
        rediscover_rate: Duration,
        token: CancellationToken,
    ) {
        let mut watch: Option<tokio::task::JoinHandle<()>> = None;
        loop {
            match group_version_served(&client, kind).await {
                Ok(true) => {
                    if watch.as_ref().map_or(true, |handle| handle.is_finished()) {
                        info!(kind = kind.kind, "starting cluster informer");
                        watch = Some(tokio::spawn(Arc::clone(&self).watch(
                            client.clone(),
                            kind,
                            token.child_token(),
                        )));
                    }
                }
                Ok(false) => {
                    if let Some(handle) = watch.take() {
                        info!(
                            kind = kind.kind,
                            "stopping cluster informer because the resource is not served"
                        );
                        handle.abort();
                    }
                }
                Err(err) => {
                    error!(kind = kind.kind, error = %err, "cannot fetch resource list for watched kind");
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(handle) = watch.take() {
                        handle.abort();
                    }
                    info!(kind = kind.kind, "informer supervisor exiting");
                    return;
                }
                _ = tokio::time::sleep(rediscover_rate) => {}
            }
        }
    }

    async fn watch(
        self: Arc<Self>,
        client: Client,
        kind: &'static WatchedKind,
        token: CancellationToken,
    ) {
        let api: Api<DynamicObject> = Api::all_with(client, &kind.api_resource());
        let mut backoff = Duration::from_secs(1);
        loop {
            let stream = watcher::watcher(api.clone(), watcher::Config::default());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = stream.try_next() => match event {
                        Ok(Some(Event::Applied(obj))) => {
                            self.process_upsert(kind, &obj).await;
                            backoff = Duration::from_secs(1);
                        }
                        Ok(Some(Event::Deleted(obj))) => self.process_delete(kind, &obj).await,
                        Ok(Some(Event::Restarted(objects))) => {
                            debug!(kind = kind.kind, count = objects.len(), "watch restarted");
                            for obj in &objects {
                                self.process_upsert(kind, obj).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(kind = kind.kind, error = %err, "watch stream error, restarting");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    /// Handles an add or update event for a watched object.
    pub async fn process_upsert(&self, kind: &WatchedKind, obj: &DynamicObject) {
        let resource = match kind.kind {
            "ManagedCluster" => transform::managed_cluster(obj),
            "ManagedClusterInfo" => transform::managed_cluster_info(obj),
            _ => return,
        };
        let Some(resource) = resource else {
            warn!(kind = kind.kind, "watched object has no name, skipping");
            return;
        };

        let _serialized = self.upsert_lock.lock().await;
        self.upsert_cluster(resource).await;
    }

    async fn upsert_cluster(&self, resource: Resource) {
        let uid = resource.uid;
        let mut properties = resource.properties;

        // Keep fields contributed by the other informer kind when this event
        // does not carry them.
        if let Some(Value::Object(cached)) = self.cache.read(&uid) {
            for (key, value) in cached {
                properties.entry(key).or_insert(value);
            }
        }
        let merged = Value::Object(properties);

        if self.known_cluster(&uid).await && self.cache.read(&uid).as_ref() == Some(&merged) {
            debug!(cluster = %uid, "cluster node already up to date");
            return;
        }

        match self.store.upsert_cluster_node(&uid, &merged).await {
            Ok(()) => {
                self.cache.update(&uid, merged);
                info!(cluster = %uid, "cluster node upserted");
            }
            Err(err) => {
                warn!(cluster = %uid, error = %err, "error inserting/updating cluster node");
            }
        }
    }

    /// Whether the cluster-node row is already known, consulting the cache
    /// first and falling back to the database.
    async fn known_cluster(&self, uid: &str) -> bool {
        if self.cache.contains(uid) {
            return true;
        }
        debug!(cluster = %uid, "cluster not cached, reading latest state from the database");
        match self.store.cluster_node(uid).await {
            Ok(Some(data)) => {
                self.cache.update(uid, data);
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!(cluster = %uid, error = %err, "error fetching cluster node");
                false
            }
        }
    }

    /// Handles a delete event. Only `ManagedCluster` removals delete the
    /// cluster-node row itself; removal of the collector addon clears the
    /// cluster's data but keeps the node.
    pub async fn process_delete(&self, kind: &WatchedKind, obj: &DynamicObject) {
        match kind.kind {
            "ManagedCluster" => {
                let Some(name) = obj.metadata.name.clone() else {
                    return;
                };
                self.delete_cluster(&name, true).await;
            }
            "ManagedClusterAddOn" => {
                if obj.metadata.name.as_deref() != Some(SEARCH_COLLECTOR_ADDON) {
                    return;
                }
                // The addon object lives in the managed cluster's namespace.
                let Some(cluster) = obj.metadata.namespace.clone() else {
                    return;
                };
                self.delete_cluster(&cluster, false).await;
            }
            _ => {}
        }
    }

    /// Cascade-deletes the cluster's resources and edges, retrying the whole
    /// transaction on failure. With `delete_cluster_node` the sentinel row is
    /// removed afterwards and the cache entry evicted.
    pub async fn delete_cluster(&self, cluster: &str, delete_cluster_node: bool) {
        let start = Instant::now();
        let store = Arc::clone(&self.store);
        let name = cluster.to_string();
        let cascade = self
            .with_retry("cluster resources and edges", move || {
                let store = Arc::clone(&store);
                let name = name.clone();
                async move { store.delete_cluster_resources(&name).await }
            })
            .await;

        if let Ok((resources, edges)) = cascade {
            if start.elapsed() > Duration::from_millis(100) {
                warn!(
                    cluster = %cluster,
                    resources,
                    edges,
                    elapsed = ?start.elapsed(),
                    "slow cluster delete"
                );
            } else {
                info!(cluster = %cluster, resources, edges, "deleted resources and edges for cluster");
            }
        }

        if delete_cluster_node {
            let uid = cluster_node_uid(cluster);
            let store = Arc::clone(&self.store);
            let node_uid = uid.clone();
            let node = self
                .with_retry("cluster node", move || {
                    let store = Arc::clone(&store);
                    let node_uid = node_uid.clone();
                    async move { store.delete_cluster_node(&node_uid).await }
                })
                .await;

            if node.is_ok() {
                self.cache.delete(&uid);
                info!(cluster = %cluster, "deleted cluster node");
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, DbError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, DbError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, what, "delete succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        error!(
                            error = %err,
                            attempts = attempt,
                            what,
                            "giving up on cluster delete"
                        );
                        return Err(err);
                    }
                    let wait = self.retry.backoff(attempt);
                    warn!(
                        error = %err,
                        retry_in = ?wait,
                        what,
                        "unable to process cluster delete transaction, will retry"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

async fn group_version_served(client: &Client, kind: &WatchedKind) -> kube::Result<bool> {
    match client.list_api_group_resources(&kind.api_version()).await {
        Ok(list) => Ok(list.resources.iter().any(|r| r.kind == kind.kind)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
        Err(err) => Err(err),
    }
}
