//! Merges expanded routes across the specs of a target and slices the result
//! into size-bounded partitions.

use crate::{
    expand::{expand_routes, ExpandError},
    resource_id::ResourceId,
};
use ahash::AHashMap as HashMap;
use customrouter_core::{Route, RoutingTable};
use customrouter_k8s_api as api;
use std::collections::BTreeMap;

/// Maximum serialized payload per partition, leaving headroom under the
/// store's 1 MiB object limit.
pub const MAX_PARTITION_BYTES: usize = 900 * 1024;

/// Base name shared by every partition `ConfigMap`.
pub const PARTITION_BASE_NAME: &str = "customrouter-routes";

/// A single size-bounded slice of a target's routing table, ready to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub target: String,
    pub index: usize,
    pub payload: String,
}

/// Per-spec outcome of an aggregation pass, surfaced as status conditions.
#[derive(Debug)]
pub struct SpecOutcome {
    pub id: ResourceId,
    pub target: String,
    pub result: Result<ExpandSummary, ExpandError>,
}

/// What a successfully expanded spec contributed.
#[derive(Debug, Default)]
pub struct ExpandSummary {
    /// Hostnames dropped because another namespace owns them.
    pub dropped_hosts: Vec<String>,
}

/// Aggregates all specs of a target into one routing table.
///
/// Specs must be pre-sorted by `(namespace, name)`; that order decides both
/// hostname ownership ties and the insertion order behind canonical sort
/// tie-breaks. A spec that fails to expand is dropped from the table; the
/// remaining specs still contribute.
pub fn aggregate_target(
    target: &str,
    specs: &[(ResourceId, &api::CustomHttpRouteSpec)],
) -> (RoutingTable, Vec<SpecOutcome>) {
    // Each hostname is owned by the lexicographically-smallest namespace
    // declaring it, so another namespace cannot hijack routing priority.
    let mut owner: HashMap<&str, &str> = HashMap::new();
    for (id, spec) in specs {
        for hostname in &spec.hostnames {
            owner
                .entry(hostname.as_str())
                .and_modify(|ns| {
                    if id.namespace.as_str() < *ns {
                        *ns = &id.namespace;
                    }
                })
                .or_insert(&id.namespace);
        }
    }

    let mut table = RoutingTable::new();
    let mut outcomes = Vec::with_capacity(specs.len());
    for (id, spec) in specs {
        match expand_routes(spec) {
            Ok(expanded) => {
                let mut summary = ExpandSummary::default();
                let mut kept = BTreeMap::new();
                for (hostname, routes) in expanded {
                    if owner.get(hostname.as_str()).copied() == Some(id.namespace.as_str()) {
                        kept.insert(hostname, routes);
                    } else {
                        tracing::warn!(
                            %hostname,
                            route.namespace = %id.namespace,
                            route.name = %id.name,
                            owner = owner.get(hostname.as_str()).copied().unwrap_or(""),
                            %target,
                            "Dropping routes for hostname owned by another namespace"
                        );
                        summary.dropped_hosts.push(hostname);
                    }
                }
                table.merge(RoutingTable {
                    version: customrouter_core::TABLE_VERSION,
                    hosts: kept,
                });
                outcomes.push(SpecOutcome {
                    id: id.clone(),
                    target: target.to_string(),
                    result: Ok(summary),
                });
            }
            Err(error) => {
                tracing::warn!(
                    route.namespace = %id.namespace,
                    route.name = %id.name,
                    %target,
                    %error,
                    "Skipping route that failed to expand"
                );
                outcomes.push(SpecOutcome {
                    id: id.clone(),
                    target: target.to_string(),
                    result: Err(error),
                });
            }
        }
    }

    table.sort();
    (table, outcomes)
}

/// Slices a table into partitions no larger than [`MAX_PARTITION_BYTES`].
///
/// The whole table goes out as one partition when it fits. Otherwise hosts
/// are packed greedily in alphabetical order, and a host whose routes alone
/// exceed the limit is split across several partitions that each advertise
/// the host with a disjoint subset of its rows.
pub fn partition_table(target: &str, table: &RoutingTable) -> Vec<Partition> {
    let payload = table.to_canonical_json();
    if payload.len() <= MAX_PARTITION_BYTES {
        return vec![Partition {
            name: partition_name(target, 0),
            target: target.to_string(),
            index: 0,
            payload,
        }];
    }

    let mut partitions = Vec::new();
    let mut current = RoutingTable::new();
    let mut current_len = 0usize;

    let flush = |current: &mut RoutingTable, current_len: &mut usize, out: &mut Vec<Partition>| {
        if current.hosts.is_empty() {
            return;
        }
        let index = out.len();
        out.push(Partition {
            name: partition_name(target, index),
            target: target.to_string(),
            index,
            payload: current.to_canonical_json(),
        });
        *current = RoutingTable::new();
        *current_len = 0;
    };

    for (host, routes) in &table.hosts {
        let host_len = single_host_len(host, routes);

        if host_len > MAX_PARTITION_BYTES {
            flush(&mut current, &mut current_len, &mut partitions);
            split_host(target, host, routes, &mut partitions);
            continue;
        }

        if current_len + host_len > MAX_PARTITION_BYTES {
            flush(&mut current, &mut current_len, &mut partitions);
        }
        current.hosts.insert(host.clone(), routes.clone());
        current_len += host_len;
    }
    flush(&mut current, &mut current_len, &mut partitions);

    partitions
}

/// Splits a single oversized host's routes across several partitions. The
/// data plane concatenates the advertised subsets back together.
fn split_host(target: &str, host: &str, routes: &[Route], out: &mut Vec<Partition>) {
    let base_len = single_host_len(host, &[]);

    let mut current: Vec<Route> = Vec::new();
    let mut current_len = 0usize;
    for route in routes {
        let route_len =
            serde_json::to_string(route).expect("route serialization cannot fail").len() + 1;
        if base_len + current_len + route_len > MAX_PARTITION_BYTES && !current.is_empty() {
            push_host_partition(target, host, std::mem::take(&mut current), out);
            current_len = 0;
        }
        current.push(route.clone());
        current_len += route_len;
    }
    if !current.is_empty() {
        push_host_partition(target, host, current, out);
    }
}

fn push_host_partition(target: &str, host: &str, routes: Vec<Route>, out: &mut Vec<Partition>) {
    let mut table = RoutingTable::new();
    table.hosts.insert(host.to_string(), routes);
    let index = out.len();
    out.push(Partition {
        name: partition_name(target, index),
        target: target.to_string(),
        index,
        payload: table.to_canonical_json(),
    });
}

fn single_host_len(host: &str, routes: &[Route]) -> usize {
    let mut table = RoutingTable::new();
    table.hosts.insert(host.to_string(), routes.to_vec());
    table.to_canonical_json().len()
}

pub fn partition_name(target: &str, index: usize) -> String {
    format!("{PARTITION_BASE_NAME}-{target}-{index}")
}
