#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Control-plane state for the customrouter controller: route expansion,
//! per-target aggregation and partitioning, admission-time conflict
//! detection, filter-artifact compilation, and the reconciliation machinery
//! that keeps the cluster in sync with it all.

pub mod aggregate;
pub mod catchall;
pub mod conflict;
mod controller;
pub mod envoyfilter;
pub mod expand;
mod index;
mod metrics;
mod resource_id;
mod retry;
pub mod status;

pub use self::{
    aggregate::{
        aggregate_target, partition_table, ExpandSummary, Partition, SpecOutcome,
        MAX_PARTITION_BYTES,
    },
    controller::Controller,
    expand::{expand_routes, ExpandError, MAX_ROUTES_PER_SPEC},
    index::{AttachmentUpdate, Index, RoutesUpdate, SharedIndex, Update},
    metrics::ControllerMetrics,
    resource_id::ResourceId,
};
