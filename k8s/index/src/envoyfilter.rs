//! Builds the gateway filter artifacts owned by an attachment.
//!
//! Each attachment owns up to three `EnvoyFilter` objects, named by suffix:
//! `-extproc` inserts the external processor into the gateway's HTTP filter
//! chain, `-routes` injects the header-driven dynamic route, and `-catchall`
//! adds per-hostname default virtual hosts. The objects are opaque to the
//! rest of the pipeline and built as plain JSON.

use crate::catchall::CatchAllEntry;
use customrouter_k8s_api::{
    self as api, ATTACHMENT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use serde_json::{json, Value};

pub const EXTPROC_SUFFIX: &str = "-extproc";
pub const ROUTES_SUFFIX: &str = "-routes";
pub const CATCHALL_SUFFIX: &str = "-catchall";

/// The header the engine sets to steer the gateway to an upstream cluster.
pub const CLUSTER_HEADER: &str = "x-customrouter-cluster";

const ENVOYFILTER_API_VERSION: &str = "networking.istio.io/v1alpha3";
const DEFAULT_TIMEOUT: &str = "5s";

/// Identity of the attachment the artifacts belong to.
#[derive(Clone, Debug)]
pub struct AttachmentMeta {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// A fully rendered filter artifact.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub name: String,
    pub namespace: String,
    pub object: Value,
}

/// Derives the gateway's upstream cluster name for a service reference.
/// Dotted names are literal hosts; everything else resolves in-cluster.
pub fn cluster_name(name: &str, namespace: &str, port: u16) -> String {
    if name.contains('.') {
        format!("outbound|{port}||{name}")
    } else {
        format!("outbound|{port}||{name}.{namespace}.svc.cluster.local")
    }
}

fn metadata(meta: &AttachmentMeta, suffix: &str) -> Value {
    let mut labels = serde_json::Map::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        Value::String("customrouter".to_string()),
    );
    labels.insert(
        MANAGED_BY_LABEL.to_string(),
        Value::String(MANAGED_BY_VALUE.to_string()),
    );
    labels.insert(ATTACHMENT_LABEL.to_string(), Value::String(meta.name.clone()));
    json!({
        "name": format!("{}{suffix}", meta.name),
        "namespace": meta.namespace,
        "labels": labels,
        "ownerReferences": [{
            "apiVersion": "customrouter.io/v1alpha1",
            "kind": "ExternalProcessorAttachment",
            "name": meta.name,
            "uid": meta.uid,
            "controller": true,
        }],
    })
}

fn workload_selector(spec: &api::ExternalProcessorAttachmentSpec) -> Value {
    json!({ "labels": spec.gateway_ref.selector })
}

/// The first-position route that forwards to whatever cluster the engine
/// named in the cluster header. Present-match guards it so untouched
/// requests fall through to the gateway's own routing.
fn dynamic_route() -> Value {
    json!({
        "name": "customrouter-dynamic-route",
        "match": {
            "prefix": "/",
            "headers": [{
                "name": CLUSTER_HEADER,
                "present_match": true,
            }],
        },
        "route": {
            "cluster_header": CLUSTER_HEADER,
            "timeout": "30s",
            "retry_policy": {
                "retry_on": "connect-failure,refused-stream,unavailable,cancelled,retriable-status-codes",
                "num_retries": 2,
                "retriable_status_codes": [503],
            },
        },
    })
}

/// Builds the `-extproc` artifact: the ext_proc filter inserted before the
/// router, calling the processor cluster, failing closed.
pub fn extproc_filter(meta: &AttachmentMeta, spec: &api::ExternalProcessorAttachmentSpec) -> Artifact {
    let processor = &spec.external_processor_ref;
    let svc = &processor.service;
    let cluster = cluster_name(&svc.name, &svc.namespace, svc.port);
    let timeout = processor.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT);
    let message_timeout = processor
        .message_timeout
        .as_deref()
        .unwrap_or(DEFAULT_TIMEOUT);

    let object = json!({
        "apiVersion": ENVOYFILTER_API_VERSION,
        "kind": "EnvoyFilter",
        "metadata": metadata(meta, EXTPROC_SUFFIX),
        "spec": {
            "workloadSelector": workload_selector(spec),
            "configPatches": [{
                "applyTo": "HTTP_FILTER",
                "match": {
                    "context": "GATEWAY",
                    "listener": {
                        "filterChain": {
                            "filter": {
                                "name": "envoy.filters.network.http_connection_manager",
                                "subFilter": { "name": "envoy.filters.http.router" },
                            },
                        },
                    },
                },
                "patch": {
                    "operation": "INSERT_BEFORE",
                    "value": {
                        "name": "envoy.filters.http.ext_proc",
                        "typed_config": {
                            "@type": "type.googleapis.com/envoy.extensions.filters.http.ext_proc.v3.ExternalProcessor",
                            "grpc_service": {
                                "envoy_grpc": { "cluster_name": cluster },
                                "timeout": timeout,
                            },
                            "failure_mode_allow": false,
                            "message_timeout": message_timeout,
                            "processing_mode": {
                                "request_header_mode": "SEND",
                                "response_header_mode": "SKIP",
                                "request_body_mode": "NONE",
                                "response_body_mode": "NONE",
                                "request_trailer_mode": "SKIP",
                                "response_trailer_mode": "SKIP",
                            },
                            "mutation_rules": {
                                "allow_all_routing": true,
                                "allow_envoy": false,
                            },
                        },
                    },
                },
            }],
        },
    });

    Artifact {
        name: format!("{}{EXTPROC_SUFFIX}", meta.name),
        namespace: meta.namespace.clone(),
        object,
    }
}

/// Builds the `-routes` artifact: the dynamic route inserted first into every
/// route configuration on the gateway.
pub fn routes_filter(meta: &AttachmentMeta, spec: &api::ExternalProcessorAttachmentSpec) -> Artifact {
    let object = json!({
        "apiVersion": ENVOYFILTER_API_VERSION,
        "kind": "EnvoyFilter",
        "metadata": metadata(meta, ROUTES_SUFFIX),
        "spec": {
            "workloadSelector": workload_selector(spec),
            "configPatches": [{
                "applyTo": "HTTP_ROUTE",
                "match": {
                    "context": "GATEWAY",
                    "routeConfiguration": {},
                },
                "patch": {
                    "operation": "INSERT_FIRST",
                    "value": dynamic_route(),
                },
            }],
        },
    });

    Artifact {
        name: format!("{}{ROUTES_SUFFIX}", meta.name),
        namespace: meta.namespace.clone(),
        object,
    }
}

/// Builds the `-catchall` artifact from the merged entry set, or `None` when
/// there is nothing to serve (any previously published artifact is deleted).
pub fn catchall_filter(
    meta: &AttachmentMeta,
    spec: &api::ExternalProcessorAttachmentSpec,
    entries: &[CatchAllEntry],
) -> Option<Artifact> {
    if entries.is_empty() {
        return None;
    }

    let patches: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let backend = &entry.backend;
            let fallback = cluster_name(&backend.name, &backend.namespace, backend.port);
            json!({
                "applyTo": "VIRTUAL_HOST",
                "match": { "context": "GATEWAY" },
                "patch": {
                    "operation": "ADD",
                    "value": {
                        "name": format!("customrouter-catchall-{}", entry.hostname),
                        "domains": [entry.hostname],
                        "routes": [
                            dynamic_route(),
                            {
                                "name": "default",
                                "match": { "prefix": "/" },
                                "route": {
                                    "cluster": fallback,
                                    "timeout": "30s",
                                },
                            },
                        ],
                    },
                },
            })
        })
        .collect();

    let object = json!({
        "apiVersion": ENVOYFILTER_API_VERSION,
        "kind": "EnvoyFilter",
        "metadata": metadata(meta, CATCHALL_SUFFIX),
        "spec": {
            "workloadSelector": workload_selector(spec),
            "configPatches": patches,
        },
    });

    Some(Artifact {
        name: format!("{}{CATCHALL_SUFFIX}", meta.name),
        namespace: meta.namespace.clone(),
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta() -> AttachmentMeta {
        AttachmentMeta {
            namespace: "gateways".to_string(),
            name: "edge".to_string(),
            uid: "uid-1".to_string(),
        }
    }

    fn spec() -> api::ExternalProcessorAttachmentSpec {
        api::ExternalProcessorAttachmentSpec {
            gateway_ref: api::GatewayRef {
                selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
            },
            external_processor_ref: api::ExternalProcessorRef {
                service: api::ServiceRef {
                    name: "extproc".to_string(),
                    namespace: "customrouter".to_string(),
                    port: 9001,
                },
                timeout: None,
                message_timeout: Some("2s".to_string()),
            },
            catch_all_route: None,
        }
    }

    #[test]
    fn cluster_name_applies_dot_rule() {
        assert_eq!(
            cluster_name("web", "apps", 80),
            "outbound|80||web.apps.svc.cluster.local"
        );
        assert_eq!(
            cluster_name("legacy.example.com", "ignored", 443),
            "outbound|443||legacy.example.com"
        );
    }

    #[test]
    fn extproc_filter_shape() {
        let artifact = extproc_filter(&meta(), &spec());
        assert_eq!(artifact.name, "edge-extproc");
        assert_eq!(artifact.namespace, "gateways");

        let object = &artifact.object;
        assert_eq!(object["metadata"]["labels"][MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(object["metadata"]["labels"][ATTACHMENT_LABEL], "edge");
        assert_eq!(object["metadata"]["ownerReferences"][0]["uid"], "uid-1");
        assert_eq!(
            object["spec"]["workloadSelector"]["labels"]["istio"],
            "ingressgateway"
        );

        let typed = &object["spec"]["configPatches"][0]["patch"]["value"]["typed_config"];
        assert_eq!(typed["failure_mode_allow"], false);
        assert_eq!(typed["grpc_service"]["timeout"], "5s");
        assert_eq!(typed["message_timeout"], "2s");
        assert_eq!(
            typed["grpc_service"]["envoy_grpc"]["cluster_name"],
            "outbound|9001||extproc.customrouter.svc.cluster.local"
        );
        assert_eq!(typed["processing_mode"]["request_header_mode"], "SEND");
        assert_eq!(typed["mutation_rules"]["allow_envoy"], false);
        assert_eq!(typed["mutation_rules"]["allow_all_routing"], true);
    }

    #[test]
    fn routes_filter_shape() {
        let artifact = routes_filter(&meta(), &spec());
        assert_eq!(artifact.name, "edge-routes");

        let patch = &artifact.object["spec"]["configPatches"][0];
        assert_eq!(patch["applyTo"], "HTTP_ROUTE");
        assert_eq!(patch["patch"]["operation"], "INSERT_FIRST");

        let value = &patch["patch"]["value"];
        assert_eq!(value["match"]["headers"][0]["name"], CLUSTER_HEADER);
        assert_eq!(value["match"]["headers"][0]["present_match"], true);
        assert_eq!(value["route"]["cluster_header"], CLUSTER_HEADER);
        assert_eq!(value["route"]["timeout"], "30s");
        assert_eq!(value["route"]["retry_policy"]["num_retries"], 2);
        assert_eq!(value["route"]["retry_policy"]["retriable_status_codes"][0], 503);
    }

    #[test]
    fn catchall_filter_adds_one_virtual_host_per_entry() {
        let entries = vec![
            CatchAllEntry {
                hostname: "a.example.com".to_string(),
                backend: api::BackendRef {
                    name: "web".to_string(),
                    namespace: "apps".to_string(),
                    port: 80,
                },
            },
            CatchAllEntry {
                hostname: "b.example.com".to_string(),
                backend: api::BackendRef {
                    name: "legacy.example.com".to_string(),
                    namespace: "ignored".to_string(),
                    port: 443,
                },
            },
        ];
        let artifact = catchall_filter(&meta(), &spec(), &entries).unwrap();
        assert_eq!(artifact.name, "edge-catchall");

        let patches = artifact.object["spec"]["configPatches"].as_array().unwrap();
        assert_eq!(patches.len(), 2);

        let vh = &patches[0]["patch"]["value"];
        assert_eq!(vh["domains"][0], "a.example.com");
        // First route dispatches on the cluster header, second is the default.
        assert_eq!(vh["routes"][0]["route"]["cluster_header"], CLUSTER_HEADER);
        assert_eq!(
            vh["routes"][1]["route"]["cluster"],
            "outbound|80||web.apps.svc.cluster.local"
        );

        let vh = &patches[1]["patch"]["value"];
        assert_eq!(vh["routes"][1]["route"]["cluster"], "outbound|443||legacy.example.com");
    }

    #[test]
    fn catchall_filter_absent_when_no_entries() {
        assert!(catchall_filter(&meta(), &spec(), &[]).is_none());
    }
}
