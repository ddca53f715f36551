//! The reconciliation index.
//!
//! Resource watches feed this index; every change recomputes the affected
//! derived state (partitions, statuses, filter artifacts) and sends it to
//! the write [`Controller`](crate::Controller) over a channel. The index
//! itself never performs API writes.

use crate::{
    aggregate::{aggregate_target, partition_table, Partition, SpecOutcome},
    catchall::merge_catch_all_entries,
    envoyfilter::{self, Artifact, AttachmentMeta},
    resource_id::ResourceId,
};
use customrouter_k8s_api::{self as api, ResourceExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    routes: BTreeMap<ResourceId, api::CustomHttpRouteSpec>,
    attachments: BTreeMap<ResourceId, AttachmentState>,
    updates: UnboundedSender<Update>,
}

#[derive(Clone)]
struct AttachmentState {
    spec: api::ExternalProcessorAttachmentSpec,
    uid: String,
}

/// Work sent to the write controller.
pub enum Update {
    Routes(RoutesUpdate),
    Attachment(AttachmentUpdate),
    AttachmentDeleted { namespace: String, names: Vec<String> },
}

pub struct RoutesUpdate {
    pub partitions: Vec<Partition>,
    /// Names of every partition that should exist after this update; the
    /// controller deletes managed partitions outside this set.
    pub active: HashSet<String>,
    pub outcomes: Vec<SpecOutcome>,
}

pub struct AttachmentUpdate {
    pub id: ResourceId,
    pub artifacts: Vec<Artifact>,
    /// Artifact names that must no longer exist (the catch-all when its
    /// entry set became empty).
    pub delete: Vec<String>,
}

// === impl Index ===

impl Index {
    pub fn shared(updates: UnboundedSender<Update>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            routes: BTreeMap::new(),
            attachments: BTreeMap::new(),
            updates,
        }))
    }

    /// Periodically republishes the full derived state so that failed
    /// writes and leadership changes converge without waiting for a
    /// resource event.
    pub async fn run(index: SharedIndex, period: tokio::time::Duration) {
        loop {
            tokio::time::sleep(period).await;
            let index = index.read();
            index.reindex_routes();
            index.reindex_attachments();
        }
    }

    fn send(&self, update: Update) {
        if self.updates.send(update).is_err() {
            tracing::error!("Write controller has shut down; dropping update");
        }
    }

    /// Recomputes every target's partitions from the live route set.
    fn reindex_routes(&self) {
        let mut by_target: BTreeMap<&str, Vec<(ResourceId, &api::CustomHttpRouteSpec)>> =
            BTreeMap::new();
        for (id, spec) in &self.routes {
            by_target
                .entry(spec.target_ref.name.as_str())
                .or_default()
                .push((id.clone(), spec));
        }

        let mut partitions = Vec::new();
        let mut outcomes = Vec::new();
        for (target, specs) in by_target {
            let (table, target_outcomes) = aggregate_target(target, &specs);
            partitions.extend(partition_table(target, &table));
            outcomes.extend(target_outcomes);
        }

        let active = partitions.iter().map(|p| p.name.clone()).collect();
        self.send(Update::Routes(RoutesUpdate {
            partitions,
            active,
            outcomes,
        }));
    }

    /// Rebuilds the filter artifacts of every attachment. Cheap enough to do
    /// wholesale; route changes can alter any attachment's catch-all set.
    fn reindex_attachments(&self) {
        for (id, state) in &self.attachments {
            self.send(self.attachment_update(id, state));
        }
    }

    fn attachment_update(&self, id: &ResourceId, state: &AttachmentState) -> Update {
        let meta = AttachmentMeta {
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            uid: state.uid.clone(),
        };

        let mut artifacts = vec![
            envoyfilter::extproc_filter(&meta, &state.spec),
            envoyfilter::routes_filter(&meta, &state.spec),
        ];

        let entries = merge_catch_all_entries(self.routes.iter(), &state.spec);
        let mut delete = Vec::new();
        match envoyfilter::catchall_filter(&meta, &state.spec, &entries) {
            Some(artifact) => artifacts.push(artifact),
            None => delete.push(format!("{}{}", id.name, envoyfilter::CATCHALL_SUFFIX)),
        }

        Update::Attachment(AttachmentUpdate {
            id: id.clone(),
            artifacts,
            delete,
        })
    }

    fn remove_route(&mut self, id: &ResourceId) {
        if self.routes.remove(id).is_some() {
            self.reindex_routes();
            self.reindex_attachments();
        }
    }

    fn remove_attachment(&mut self, id: &ResourceId) {
        if self.attachments.remove(id).is_some() {
            self.send(Update::AttachmentDeleted {
                namespace: id.namespace.clone(),
                names: vec![
                    format!("{}{}", id.name, envoyfilter::EXTPROC_SUFFIX),
                    format!("{}{}", id.name, envoyfilter::ROUTES_SUFFIX),
                    format!("{}{}", id.name, envoyfilter::CATCHALL_SUFFIX),
                ],
            });
        }
    }
}

impl kubert::index::IndexNamespacedResource<api::CustomHttpRoute> for Index {
    fn apply(&mut self, resource: api::CustomHttpRoute) {
        let namespace = resource.namespace().expect("CustomHTTPRoute must be namespaced");
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);

        // A resource awaiting finalization no longer contributes routes.
        if resource.metadata.deletion_timestamp.is_some() {
            self.remove_route(&id);
            return;
        }

        if self.routes.get(&id) == Some(&resource.spec) {
            return;
        }
        self.routes.insert(id, resource.spec);
        self.reindex_routes();
        self.reindex_attachments();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove_route(&ResourceId::new(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<api::ExternalProcessorAttachment> for Index {
    fn apply(&mut self, resource: api::ExternalProcessorAttachment) {
        let namespace = resource
            .namespace()
            .expect("ExternalProcessorAttachment must be namespaced");
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);

        if resource.metadata.deletion_timestamp.is_some() {
            self.remove_attachment(&id);
            return;
        }

        let state = AttachmentState {
            spec: resource.spec,
            uid: resource.metadata.uid.unwrap_or_default(),
        };
        let update = self.attachment_update(&id, &state);
        self.attachments.insert(id, state);
        self.send(update);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove_attachment(&ResourceId::new(namespace, name));
    }
}
