//! The write controller: drains updates from the index and applies them to
//! the cluster with conflict retry. A failed write surfaces through status
//! conditions and metrics; it never stalls other updates.

use crate::{
    aggregate::{Partition, PARTITION_BASE_NAME},
    index::{AttachmentUpdate, RoutesUpdate, Update},
    metrics::ControllerMetrics,
    resource_id::ResourceId,
    retry::with_backoff,
    status,
};
use customrouter_k8s_api::{
    self as api, Api, Condition, ConfigMap, DynamicObject, ObjectMeta, Patch, PatchParams,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, PART_LABEL, TARGET_LABEL,
};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc::UnboundedReceiver;

const ROUTES_DATA_KEY: &str = "routes.json";

pub struct Controller {
    claims: tokio::sync::watch::Receiver<std::sync::Arc<kubert::lease::Claim>>,
    claimant: String,
    client: api::Client,
    partition_namespace: String,
    updates: UnboundedReceiver<Update>,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: tokio::sync::watch::Receiver<std::sync::Arc<kubert::lease::Claim>>,
        claimant: String,
        client: api::Client,
        partition_namespace: String,
        updates: UnboundedReceiver<Update>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            claimant,
            client,
            partition_namespace,
            updates,
            metrics,
        }
    }

    pub async fn run(mut self) {
        while let Some(update) = self.updates.recv().await {
            // Only the lease holder writes; standby replicas keep their
            // index warm and converge via the periodic reindex once they
            // claim the lease.
            if !self.claims.borrow().is_current_for(&self.claimant) {
                tracing::debug!("Not the lease holder; skipping update");
                continue;
            }
            match update {
                Update::Routes(update) => self.apply_routes(update).await,
                Update::Attachment(update) => self.apply_attachment(update).await,
                Update::AttachmentDeleted { namespace, names } => {
                    self.delete_artifacts(&namespace, &names).await
                }
            }
        }
    }

    async fn apply_routes(&self, update: RoutesUpdate) {
        let configmaps =
            Api::<ConfigMap>::namespaced(self.client.clone(), &self.partition_namespace);

        // Publication is best-effort per partition; a failure marks the
        // target unsynced but the remaining partitions still go out.
        let mut failed_targets: HashSet<String> = HashSet::new();
        for partition in &update.partitions {
            match self.upsert_partition(&configmaps, partition).await {
                Ok(()) => {
                    self.metrics.partitions_published.inc();
                }
                Err(error) => {
                    tracing::warn!(
                        partition = %partition.name,
                        target = %partition.target,
                        %error,
                        "Failed to publish partition"
                    );
                    self.metrics.partition_publish_errors.inc();
                    failed_targets.insert(partition.target.clone());
                }
            };
        }

        if let Err(error) = self.delete_stale_partitions(&configmaps, &update.active).await {
            tracing::warn!(%error, "Failed to prune stale partitions");
        }

        for outcome in &update.outcomes {
            let mut conditions = Vec::with_capacity(2);
            match &outcome.result {
                Ok(summary) => {
                    let message = if summary.dropped_hosts.is_empty() {
                        "routes were expanded and aggregated".to_string()
                    } else {
                        format!(
                            "routes expanded; hostnames {:?} dropped (owned by another namespace)",
                            summary.dropped_hosts
                        )
                    };
                    conditions.push(status::reconciled(&message));
                }
                Err(error) => {
                    conditions.push(status::reconcile_failed(error.reason(), &error.to_string()));
                }
            }
            let synced = !failed_targets.contains(&outcome.target);
            conditions.push(if synced {
                status::partitions_synced()
            } else {
                status::partitions_sync_failed("one or more partitions failed to publish")
            });

            self.patch_route_status(&outcome.id, conditions).await;
        }
    }

    async fn upsert_partition(
        &self,
        configmaps: &Api<ConfigMap>,
        partition: &Partition,
    ) -> Result<(), kube::Error> {
        let labels: BTreeMap<String, String> = [
            ("app.kubernetes.io/name".to_string(), "customrouter".to_string()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (TARGET_LABEL.to_string(), partition.target.clone()),
            (PART_LABEL.to_string(), partition.index.to_string()),
        ]
        .into();
        let data: BTreeMap<String, String> =
            [(ROUTES_DATA_KEY.to_string(), partition.payload.clone())].into();

        with_backoff(|| {
            let api = configmaps.clone();
            let name = partition.name.clone();
            let namespace = self.partition_namespace.clone();
            let labels = labels.clone();
            let data = data.clone();
            async move {
                match api.get_opt(&name).await? {
                    None => {
                        let cm = ConfigMap {
                            metadata: ObjectMeta {
                                name: Some(name.clone()),
                                namespace: Some(namespace),
                                labels: Some(labels),
                                ..Default::default()
                            },
                            data: Some(data),
                            ..Default::default()
                        };
                        api.create(&PostParams::default(), &cm).await?;
                    }
                    Some(mut existing) => {
                        existing.metadata.labels = Some(labels);
                        existing.data = Some(data);
                        existing.metadata.managed_fields = None;
                        api.replace(&name, &PostParams::default(), &existing).await?;
                    }
                }
                Ok(())
            }
        })
        .await
    }

    async fn delete_stale_partitions(
        &self,
        configmaps: &Api<ConfigMap>,
        active: &HashSet<String>,
    ) -> Result<(), kube::Error> {
        let params = ListParams::default()
            .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        for cm in configmaps.list(&params).await? {
            let Some(name) = cm.metadata.name else { continue };
            if !name.starts_with(PARTITION_BASE_NAME) || active.contains(&name) {
                continue;
            }
            tracing::info!(partition = %name, "Deleting stale partition");
            if let Err(error) = configmaps.delete(&name, &DeleteParams::default()).await {
                if !is_not_found(&error) {
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    async fn patch_route_status(&self, id: &ResourceId, conditions: Vec<Condition>) {
        let routes = Api::<api::CustomHttpRoute>::namespaced(self.client.clone(), &id.namespace);
        let patch = serde_json::json!({
            "apiVersion": "customrouter.io/v1alpha1",
            "kind": "CustomHTTPRoute",
            "status": { "conditions": conditions },
        });
        let result = with_backoff(|| {
            let api = routes.clone();
            let name = id.name.clone();
            let patch = patch.clone();
            async move {
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        })
        .await;
        match result {
            Ok(()) => {
                self.metrics.status_patches.inc();
            }
            // The route may have been deleted while the update was in flight.
            Err(error) if is_not_found(&error) => {}
            Err(error) => {
                tracing::warn!(route = %id, %error, "Failed to patch status");
                self.metrics.status_patch_errors.inc();
            }
        }
    }

    async fn apply_attachment(&self, update: AttachmentUpdate) {
        let filters = self.envoyfilters(&update.id.namespace);

        let mut ok = true;
        for artifact in &update.artifacts {
            match self.upsert_artifact(&filters, &artifact.name, &artifact.object).await {
                Ok(()) => {
                    self.metrics.artifacts_published.inc();
                }
                Err(error) => {
                    tracing::warn!(artifact = %artifact.name, %error, "Failed to publish filter artifact");
                    self.metrics.artifact_publish_errors.inc();
                    ok = false;
                }
            }
        }
        for name in &update.delete {
            if let Err(error) = filters.delete(name, &DeleteParams::default()).await {
                if !is_not_found(&error) {
                    tracing::warn!(artifact = %name, %error, "Failed to delete filter artifact");
                    ok = false;
                }
            }
        }

        self.patch_attachment_status(&update.id, ok).await;
    }

    async fn delete_artifacts(&self, namespace: &str, names: &[String]) {
        let filters = self.envoyfilters(namespace);
        for name in names {
            if let Err(error) = filters.delete(name, &DeleteParams::default()).await {
                if !is_not_found(&error) {
                    tracing::warn!(artifact = %name, %error, "Failed to delete filter artifact");
                }
            }
        }
    }

    async fn upsert_artifact(
        &self,
        filters: &Api<DynamicObject>,
        name: &str,
        object: &serde_json::Value,
    ) -> Result<(), kube::Error> {
        let desired: DynamicObject = serde_json::from_value(object.clone())
            .expect("filter artifacts are well-formed dynamic objects");
        with_backoff(|| {
            let api = filters.clone();
            let name = name.to_string();
            let desired = desired.clone();
            async move {
                match api.get_opt(&name).await? {
                    None => {
                        api.create(&PostParams::default(), &desired).await?;
                    }
                    Some(existing) => {
                        let mut desired = desired;
                        desired.metadata.resource_version = existing.metadata.resource_version;
                        api.replace(&name, &PostParams::default(), &desired).await?;
                    }
                }
                Ok(())
            }
        })
        .await
    }

    async fn patch_attachment_status(&self, id: &ResourceId, ok: bool) {
        let attachments =
            Api::<api::ExternalProcessorAttachment>::namespaced(self.client.clone(), &id.namespace);
        let condition = if ok {
            status::reconciled("filter artifacts are up to date")
        } else {
            status::reconcile_failed(
                status::REASON_RECONCILE_ERROR,
                "one or more filter artifacts failed to publish",
            )
        };
        let patch = serde_json::json!({
            "apiVersion": "customrouter.io/v1alpha1",
            "kind": "ExternalProcessorAttachment",
            "status": { "conditions": [condition] },
        });
        let result = with_backoff(|| {
            let api = attachments.clone();
            let name = id.name.clone();
            let patch = patch.clone();
            async move {
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        })
        .await;
        if let Err(error) = result {
            if !is_not_found(&error) {
                tracing::warn!(attachment = %id, %error, "Failed to patch status");
            }
        }
    }

    fn envoyfilters(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "networking.istio.io",
            "v1alpha3",
            "EnvoyFilter",
        ));
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 404)
}
