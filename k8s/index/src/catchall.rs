//! Merging of per-hostname catch-all declarations.

use crate::resource_id::ResourceId;
use customrouter_k8s_api as api;
use std::collections::BTreeMap;

/// A hostname with the backend its catch-all virtual host falls back to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchAllEntry {
    pub hostname: String,
    pub backend: api::BackendRef,
}

/// Collects catch-all entries from every active route and merges them with
/// an attachment's own declaration.
///
/// Routes must be pre-sorted by `(namespace, name)`; when several declare the
/// same hostname the later one wins. The attachment's entries override
/// per-hostname. The result is sorted by hostname.
pub fn merge_catch_all_entries<'r>(
    routes: impl IntoIterator<Item = (&'r ResourceId, &'r api::CustomHttpRouteSpec)>,
    attachment: &api::ExternalProcessorAttachmentSpec,
) -> Vec<CatchAllEntry> {
    let mut merged: BTreeMap<String, api::BackendRef> = BTreeMap::new();

    for (_, spec) in routes {
        let Some(catch_all) = &spec.catch_all_route else {
            continue;
        };
        for hostname in &spec.hostnames {
            merged.insert(hostname.clone(), catch_all.backend_ref.clone());
        }
    }

    if let Some(catch_all) = &attachment.catch_all_route {
        for hostname in &catch_all.hostnames {
            merged.insert(hostname.clone(), catch_all.backend_ref.clone());
        }
    }

    merged
        .into_iter()
        .map(|(hostname, backend)| CatchAllEntry { hostname, backend })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> api::BackendRef {
        api::BackendRef {
            name: name.to_string(),
            namespace: "apps".to_string(),
            port: 80,
        }
    }

    fn route_spec(hostnames: &[&str], catch_all: Option<&str>) -> api::CustomHttpRouteSpec {
        api::CustomHttpRouteSpec {
            target_ref: api::TargetRef {
                name: "t".to_string(),
            },
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            path_prefixes: None,
            catch_all_route: catch_all.map(|name| api::CatchAllBackendRef {
                backend_ref: backend(name),
            }),
            rules: vec![],
        }
    }

    fn attachment(catch_all: Option<(&[&str], &str)>) -> api::ExternalProcessorAttachmentSpec {
        api::ExternalProcessorAttachmentSpec {
            gateway_ref: Default::default(),
            external_processor_ref: Default::default(),
            catch_all_route: catch_all.map(|(hostnames, name)| api::AttachmentCatchAllRoute {
                hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
                backend_ref: backend(name),
            }),
        }
    }

    #[test]
    fn later_route_wins_for_shared_hostname() {
        let id_a = ResourceId::new("ns1".to_string(), "a".to_string());
        let id_b = ResourceId::new("ns1".to_string(), "b".to_string());
        let a = route_spec(&["x.com"], Some("first"));
        let b = route_spec(&["x.com", "y.com"], Some("second"));

        let entries = merge_catch_all_entries(
            vec![(&id_a, &a), (&id_b, &b)],
            &attachment(None),
        );
        assert_eq!(
            entries,
            vec![
                CatchAllEntry {
                    hostname: "x.com".to_string(),
                    backend: backend("second"),
                },
                CatchAllEntry {
                    hostname: "y.com".to_string(),
                    backend: backend("second"),
                },
            ]
        );
    }

    #[test]
    fn attachment_overrides_per_hostname() {
        let id = ResourceId::new("ns1".to_string(), "a".to_string());
        let spec = route_spec(&["x.com", "y.com"], Some("from-route"));
        let entries = merge_catch_all_entries(
            vec![(&id, &spec)],
            &attachment(Some((&["x.com"], "from-attachment"))),
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].backend, backend("from-attachment"));
        assert_eq!(entries[1].backend, backend("from-route"));
    }

    #[test]
    fn no_declarations_yields_no_entries() {
        let id = ResourceId::new("ns1".to_string(), "a".to_string());
        let spec = route_spec(&["x.com"], None);
        let entries = merge_catch_all_entries(vec![(&id, &spec)], &attachment(None));
        assert!(entries.is_empty());
    }
}
