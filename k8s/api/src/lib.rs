#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod attachment;
pub mod gateway;
pub mod route;

pub use self::{
    attachment::{
        AttachmentCatchAllRoute, ExternalProcessorAttachment, ExternalProcessorAttachmentSpec,
        ExternalProcessorAttachmentStatus, ExternalProcessorRef, GatewayRef, ServiceRef,
    },
    route::{
        Action, ActionType, BackendRef, CatchAllBackendRef, CustomHttpRoute, CustomHttpRouteSpec,
        CustomHttpRouteStatus, HeaderConfig, MatchType, PathMatch, PathPrefixPolicy, PathPrefixes,
        RedirectConfig, RewriteConfig, Rule, RulePathPrefixes, TargetRef,
    },
};

pub use k8s_openapi::{
    api::core::v1::{ConfigMap, Service},
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time},
};
pub use kube::{
    api::{Api, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};

/// Status condition types reported on `CustomHTTPRoute`.
pub const CONDITION_RECONCILED: &str = "Reconciled";
pub const CONDITION_PARTITIONS_SYNCED: &str = "PartitionsSynced";

/// Label identifying objects owned by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "customrouter-controller";

/// Label carrying the target name on partition `ConfigMap`s.
pub const TARGET_LABEL: &str = "customrouter.io/target";

/// Label carrying the partition index on partition `ConfigMap`s.
pub const PART_LABEL: &str = "customrouter.io/part";

/// Label linking a gateway filter artifact to its attachment.
pub const ATTACHMENT_LABEL: &str = "customrouter.io/attachment";
