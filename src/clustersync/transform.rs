//! Projections from watched control-plane objects into typed resources.
//! Informer payloads are free-form nested maps; only the fields the search
//! schema cares about cross this boundary.

use kube::core::DynamicObject;
use serde_json::{json, Map, Value};

use crate::model::{cluster_node_uid, Resource};

// Maps rbac checks for the cluster node to ManagedClusterInfo.
const CLUSTER_API_GROUP: &str = "internal.open-cluster-management.io";

/// Projects a `ManagedCluster` object. This kind is the primary source for a
/// cluster's properties; fields duplicated with `ManagedClusterInfo` are
/// taken from here.
pub fn managed_cluster(obj: &DynamicObject) -> Option<Resource> {
    let name = obj.metadata.name.clone()?;
    let mut properties = Map::new();

    if let Some(labels) = &obj.metadata.labels {
        properties.insert("label".to_string(), json!(labels));
    }
    properties.insert("kind".to_string(), Value::String("Cluster".to_string()));
    properties.insert("name".to_string(), Value::String(name.clone()));
    // The cluster's namespace on the hub carries the same name as the cluster.
    properties.insert("_clusterNamespace".to_string(), Value::String(name.clone()));
    properties.insert(
        "apigroup".to_string(),
        Value::String(CLUSTER_API_GROUP.to_string()),
    );
    // Time serializes as an RFC 3339 string.
    if let Some(created) = &obj.metadata.creation_timestamp {
        if let Ok(timestamp) = serde_json::to_value(created) {
            properties.insert("created".to_string(), timestamp);
        }
    }

    let status = &obj.data["status"];
    properties.insert("cpu".to_string(), json!(cpu_capacity(&status["capacity"]["cpu"])));
    properties.insert(
        "memory".to_string(),
        Value::String(
            status["capacity"]["memory"]
                .as_str()
                .unwrap_or("0")
                .to_string(),
        ),
    );
    properties.insert(
        "kubernetesVersion".to_string(),
        Value::String(
            status["version"]["kubernetes"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        ),
    );
    if let Some(conditions) = status["conditions"].as_array() {
        for condition in conditions {
            if let (Some(condition_type), Some(condition_status)) =
                (condition["type"].as_str(), condition["status"].as_str())
            {
                properties.insert(
                    condition_type.to_string(),
                    Value::String(condition_status.to_string()),
                );
            }
        }
    }

    Some(Resource {
        uid: cluster_node_uid(&name),
        kind: "Cluster".to_string(),
        properties,
    })
}

/// Projects a `ManagedClusterInfo` object. Contributes the console URL and
/// node count; the name matches the `ManagedCluster` for the same cluster so
/// both kinds update one cluster-node row.
pub fn managed_cluster_info(obj: &DynamicObject) -> Option<Resource> {
    let name = obj.metadata.name.clone()?;
    let mut properties = Map::new();

    let status = &obj.data["status"];
    properties.insert(
        "consoleURL".to_string(),
        Value::String(status["consoleURL"].as_str().unwrap_or_default().to_string()),
    );
    properties.insert(
        "nodes".to_string(),
        json!(status["nodeList"].as_array().map_or(0, |nodes| nodes.len())),
    );
    properties.insert("kind".to_string(), Value::String("Cluster".to_string()));
    properties.insert("name".to_string(), Value::String(name.clone()));
    properties.insert(
        "_clusterNamespace".to_string(),
        Value::String(obj.metadata.namespace.clone().unwrap_or_default()),
    );
    properties.insert(
        "apigroup".to_string(),
        Value::String(CLUSTER_API_GROUP.to_string()),
    );

    Some(Resource {
        uid: cluster_node_uid(&name),
        kind: "Cluster".to_string(),
        properties,
    })
}

/// Parses a Kubernetes cpu quantity into whole cores. Milli-quantities are
/// rounded down; unparsable values count as zero.
fn cpu_capacity(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number.as_i64().unwrap_or(0),
        Value::String(text) => {
            if let Some(milli) = text.strip_suffix('m') {
                milli.parse::<i64>().map(|v| v / 1000).unwrap_or(0)
            } else {
                text.parse().unwrap_or(0)
            }
        }
        _ => 0,
    }
}
