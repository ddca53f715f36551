use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters for the write controller, exposed on the admin server.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) partitions_published: Counter,
    pub(crate) partition_publish_errors: Counter,
    pub(crate) status_patches: Counter,
    pub(crate) status_patch_errors: Counter,
    pub(crate) artifacts_published: Counter,
    pub(crate) artifact_publish_errors: Counter,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "partitions_published",
            "Routing-table partitions written to the store",
            metrics.partitions_published.clone(),
        );
        prom.register(
            "partition_publish_errors",
            "Partition writes that failed after retries",
            metrics.partition_publish_errors.clone(),
        );
        prom.register(
            "status_patches",
            "Status subresource patches written",
            metrics.status_patches.clone(),
        );
        prom.register(
            "status_patch_errors",
            "Status subresource patches that failed after retries",
            metrics.status_patch_errors.clone(),
        );
        prom.register(
            "artifacts_published",
            "Gateway filter artifacts written",
            metrics.artifacts_published.clone(),
        );
        prom.register(
            "artifact_publish_errors",
            "Gateway filter artifact writes that failed after retries",
            metrics.artifact_publish_errors.clone(),
        );
        metrics
    }
}
