//! Materializes routing-table snapshots from partition `ConfigMap`s.
//!
//! The watch feeds this index; every change re-merges all partitions,
//! re-sorts, compiles the regex rows, and publishes the result atomically
//! through a watch channel. A payload that fails to parse or compile leaves
//! the previous snapshot in place.

use customrouter_core::{CompiledTable, Route, RouteLookup, RoutingTable};
use customrouter_k8s_api::{ConfigMap, ResourceExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

const ROUTES_DATA_KEY: &str = "routes.json";

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    partitions: BTreeMap<(String, String), String>,
    tx: watch::Sender<Arc<CompiledTable>>,
}

/// A cheap handle the engine uses to look up against the current snapshot.
#[derive(Clone, Debug)]
pub struct SnapshotHandle {
    rx: watch::Receiver<Arc<CompiledTable>>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> (SharedIndex, SnapshotHandle) {
        let (tx, rx) = watch::channel(Arc::new(CompiledTable::default()));
        let index = Arc::new(RwLock::new(Self {
            partitions: BTreeMap::new(),
            tx,
        }));
        (index, SnapshotHandle { rx })
    }

    fn rebuild(&self) {
        let mut table = RoutingTable::new();
        for ((namespace, name), payload) in &self.partitions {
            match RoutingTable::parse(payload) {
                Ok(part) => table.merge(part),
                Err(error) => {
                    tracing::warn!(
                        partition = %name,
                        %namespace,
                        %error,
                        "Invalid partition payload; retaining previous snapshot"
                    );
                    return;
                }
            }
        }
        table.sort();

        match CompiledTable::compile(table) {
            Ok(compiled) => {
                tracing::info!(
                    hosts = compiled.host_count(),
                    routes = compiled.route_count(),
                    partitions = self.partitions.len(),
                    "Published routing-table snapshot"
                );
                self.tx.send_replace(Arc::new(compiled));
            }
            Err(error) => {
                tracing::warn!(%error, "Snapshot failed to compile; retaining previous snapshot");
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<ConfigMap> for Index {
    fn apply(&mut self, cm: ConfigMap) {
        let namespace = cm.namespace().unwrap_or_default();
        let name = cm.name_unchecked();
        let key = (namespace, name);

        let payload = cm
            .data
            .as_ref()
            .and_then(|data| data.get(ROUTES_DATA_KEY).cloned());
        match payload {
            Some(payload) => {
                if self.partitions.get(&key).map(String::as_str) == Some(payload.as_str()) {
                    return;
                }
                self.partitions.insert(key, payload);
            }
            None => {
                tracing::warn!(partition = %key.1, "Partition has no routes payload");
                if self.partitions.remove(&key).is_none() {
                    return;
                }
            }
        }
        self.rebuild();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.partitions.remove(&(namespace, name)).is_some() {
            self.rebuild();
        }
    }
}

// === impl SnapshotHandle ===

impl RouteLookup for SnapshotHandle {
    fn find_route(&self, authority: &str, path: &str) -> Option<Route> {
        self.rx.borrow().find_route(authority, path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use customrouter_k8s_api::ObjectMeta;
    use kubert::index::IndexNamespacedResource;

    fn configmap(name: &str, payload: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("customrouter".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                [(ROUTES_DATA_KEY.to_string(), payload.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn publishes_snapshot_on_apply() {
        let (index, handle) = Index::shared();
        index.write().apply(configmap(
            "customrouter-routes-t-0",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/api","type":"prefix","backend":"web.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));

        let route = handle.find_route("a.example.com:443", "/api/users").unwrap();
        assert_eq!(route.backend, "web.apps.svc.cluster.local:80");
        assert!(handle.find_route("a.example.com", "/nope").is_none());
    }

    #[test]
    fn concatenates_split_host_partitions() {
        let (index, handle) = Index::shared();
        index.write().apply(configmap(
            "customrouter-routes-t-0",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/one","type":"exact","backend":"one.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));
        index.write().apply(configmap(
            "customrouter-routes-t-1",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/two","type":"exact","backend":"two.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));

        assert!(handle.find_route("a.example.com", "/one").is_some());
        assert!(handle.find_route("a.example.com", "/two").is_some());
    }

    #[test]
    fn invalid_payload_retains_previous_snapshot() {
        let (index, handle) = Index::shared();
        index.write().apply(configmap(
            "customrouter-routes-t-0",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/api","type":"prefix","backend":"web.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));
        index
            .write()
            .apply(configmap("customrouter-routes-t-1", "not json"));

        // The broken partition does not wipe the previous table.
        assert!(handle.find_route("a.example.com", "/api").is_some());
    }

    #[test]
    fn uncompilable_regex_retains_previous_snapshot() {
        let (index, handle) = Index::shared();
        index.write().apply(configmap(
            "customrouter-routes-t-0",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/api","type":"prefix","backend":"web.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));
        index.write().apply(configmap(
            "customrouter-routes-t-1",
            r#"{"version":1,"hosts":{"b.example.com":[
                {"path":"([","type":"regex","backend":"web.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));

        assert!(handle.find_route("a.example.com", "/api").is_some());
        assert!(handle.find_route("b.example.com", "/x").is_none());
    }

    #[test]
    fn delete_retracts_routes() {
        let (index, handle) = Index::shared();
        index.write().apply(configmap(
            "customrouter-routes-t-0",
            r#"{"version":1,"hosts":{"a.example.com":[
                {"path":"/api","type":"prefix","backend":"web.apps.svc.cluster.local:80","priority":1000,"actions":[]}
            ]}}"#,
        ));
        IndexNamespacedResource::<ConfigMap>::delete(
            &mut *index.write(),
            "customrouter".to_string(),
            "customrouter-routes-t-0".to_string(),
        );
        assert!(handle.find_route("a.example.com", "/api").is_none());
    }
}
