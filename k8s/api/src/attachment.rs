use crate::route::BackendRef;
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// ExternalProcessorAttachment binds an external processor to a gateway by
/// generating the filter artifacts that insert the processor into the
/// gateway's HTTP filter chain and route on its decisions.
#[derive(
    Clone,
    Debug,
    Default,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "customrouter.io",
    version = "v1alpha1",
    kind = "ExternalProcessorAttachment",
    status = "ExternalProcessorAttachmentStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProcessorAttachmentSpec {
    /// Selects the gateway workload the filter artifacts apply to.
    pub gateway_ref: GatewayRef,

    /// The external processor service the gateway calls per request.
    pub external_processor_ref: ExternalProcessorRef,

    /// Catch-all virtual hosts emitted for these hostnames, overriding any
    /// per-route catch-all declarations for the same hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_all_route: Option<AttachmentCatchAllRoute>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct GatewayRef {
    /// Workload labels used as the artifacts' workload selector.
    pub selector: BTreeMap<String, String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProcessorRef {
    pub service: ServiceRef,

    /// gRPC connection timeout as a duration string; defaults to "5s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Per-message timeout as a duration string; defaults to "5s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timeout: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentCatchAllRoute {
    pub hostnames: Vec<String>,
    pub backend_ref: BackendRef,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct ExternalProcessorAttachmentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

// === impl ExternalProcessorAttachmentSpec ===

impl ExternalProcessorAttachmentSpec {
    pub fn validate(&self) -> Result<()> {
        if self.gateway_ref.selector.is_empty() {
            bail!("gatewayRef.selector must not be empty");
        }
        let svc = &self.external_processor_ref.service;
        if svc.name.is_empty() || svc.namespace.is_empty() {
            bail!("externalProcessorRef.service name and namespace are required");
        }
        if let Some(catch_all) = &self.catch_all_route {
            if catch_all.hostnames.is_empty() {
                bail!("catchAllRoute.hostnames must not be empty");
            }
        }
        Ok(())
    }
}
