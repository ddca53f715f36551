use crate::route::{normalize_path, sort_routes, strip_port, Route, RouteKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The partition payload schema version.
pub const TABLE_VERSION: u32 = 1;

/// A target's routing table, keyed by hostname.
///
/// Hosts use a `BTreeMap` so canonical serialization lists them
/// alphabetically without an extra sorting pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub version: u32,
    pub hosts: BTreeMap<String, Vec<Route>>,
}

#[derive(Debug, Error)]
#[error("invalid regex {pattern:?} for host {host:?}: {source}")]
pub struct TableCompileError {
    pub host: String,
    pub pattern: String,
    #[source]
    source: regex::Error,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            version: TABLE_VERSION,
            hosts: BTreeMap::new(),
        }
    }

    /// Serializes the table in its canonical form: compact JSON, hosts in
    /// alphabetical order, routes in the order they are stored.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).expect("routing table serialization cannot fail")
    }

    /// Parses a partition payload.
    ///
    /// Rows that fail to deserialize (e.g. an unrecognized action type) are
    /// dropped individually; the rest of the payload is kept.
    pub fn parse(data: &str) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        struct RawTable {
            #[serde(default = "default_version")]
            version: u32,
            #[serde(default)]
            hosts: BTreeMap<String, Vec<serde_json::Value>>,
        }
        fn default_version() -> u32 {
            TABLE_VERSION
        }

        let raw: RawTable = serde_json::from_str(data)?;
        let mut hosts = BTreeMap::new();
        for (host, rows) in raw.hosts {
            let mut routes = Vec::with_capacity(rows.len());
            for row in rows {
                match serde_json::from_value::<Route>(row) {
                    Ok(route) => routes.push(route),
                    Err(error) => {
                        tracing::warn!(%host, %error, "Dropping unparseable route row");
                    }
                }
            }
            hosts.insert(host, routes);
        }
        Ok(Self {
            version: raw.version,
            hosts,
        })
    }

    /// Appends another table's routes, host by host. Callers re-sort after
    /// merging all inputs.
    pub fn merge(&mut self, other: RoutingTable) {
        for (host, routes) in other.hosts {
            self.hosts.entry(host).or_default().extend(routes);
        }
    }

    /// Re-sorts every host's routes into canonical order.
    pub fn sort(&mut self) {
        for routes in self.hosts.values_mut() {
            sort_routes(routes);
        }
    }

    pub fn route_count(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }
}

/// A routing table with every regex row pre-compiled, ready for lookups.
#[derive(Debug, Default)]
pub struct CompiledTable {
    hosts: BTreeMap<String, Vec<CompiledRoute>>,
}

#[derive(Debug)]
pub struct CompiledRoute {
    pub route: Route,
    regex: Option<Regex>,
}

impl CompiledRoute {
    pub fn matches(&self, path: &str) -> bool {
        match self.route.kind {
            RouteKind::Exact => normalize_path(path) == normalize_path(&self.route.path),
            RouteKind::Prefix => path.starts_with(&self.route.path),
            RouteKind::Regex => match &self.regex {
                Some(re) => re.is_match(path),
                None => false,
            },
        }
    }
}

impl CompiledTable {
    /// Compiles every regex row. A single uncompilable pattern fails the
    /// whole table; callers retain their previous snapshot in that case.
    pub fn compile(table: RoutingTable) -> Result<Self, TableCompileError> {
        let mut hosts = BTreeMap::new();
        for (host, routes) in table.hosts {
            let mut compiled = Vec::with_capacity(routes.len());
            for route in routes {
                let regex = if route.kind == RouteKind::Regex {
                    Some(
                        Regex::new(&route.path).map_err(|source| TableCompileError {
                            host: host.clone(),
                            pattern: route.path.clone(),
                            source,
                        })?,
                    )
                } else {
                    None
                };
                compiled.push(CompiledRoute { route, regex });
            }
            hosts.insert(host, compiled);
        }
        Ok(Self { hosts })
    }

    /// Returns the first route matching `(authority, path)` in canonical
    /// order. The authority's port is ignored.
    pub fn find_route(&self, authority: &str, path: &str) -> Option<&Route> {
        let routes = self.hosts.get(strip_port(authority))?;
        routes
            .iter()
            .find(|r| r.matches(path))
            .map(|r| &r.route)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn route_count(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Action;

    fn route(path: &str, kind: RouteKind, priority: i32) -> Route {
        Route {
            path: path.to_string(),
            kind,
            backend: "health.infra.svc.cluster.local:8080".to_string(),
            priority,
            actions: vec![],
        }
    }

    fn table(host: &str, routes: Vec<Route>) -> RoutingTable {
        let mut t = RoutingTable::new();
        t.hosts.insert(host.to_string(), routes);
        t
    }

    #[test]
    fn canonical_json_shape() {
        let t = table(
            "a.example.com",
            vec![route("/health", RouteKind::Exact, 2000)],
        );
        assert_eq!(
            t.to_canonical_json(),
            r#"{"version":1,"hosts":{"a.example.com":[{"path":"/health","type":"exact","backend":"health.infra.svc.cluster.local:8080","priority":2000,"actions":[]}]}}"#
        );
    }

    #[test]
    fn parse_round_trips_canonical_json() {
        let mut t = table(
            "a.example.com",
            vec![
                route("/health", RouteKind::Exact, 2000),
                Route {
                    actions: vec![Action::HeaderSet {
                        name: "x-env".to_string(),
                        value: "prod".to_string(),
                    }],
                    ..route("/api", RouteKind::Prefix, 1000)
                },
            ],
        );
        t.hosts
            .insert("b.example.com".to_string(), vec![route("^/x$", RouteKind::Regex, 1000)]);

        let parsed = RoutingTable::parse(&t.to_canonical_json()).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn parse_drops_rows_with_unknown_action_type() {
        let payload = r#"{"version":1,"hosts":{"a.example.com":[
            {"path":"/ok","type":"prefix","backend":"b:80","priority":1000,"actions":[]},
            {"path":"/bad","type":"prefix","backend":"b:80","priority":1000,
             "actions":[{"type":"teleport","name":"x"}]}
        ]}}"#;
        let parsed = RoutingTable::parse(payload).unwrap();
        let routes = &parsed.hosts["a.example.com"];
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/ok");
    }

    #[test]
    fn parse_ignores_unknown_fields_and_defaults_priority() {
        let payload = r#"{"version":1,"hosts":{"a.example.com":[
            {"path":"/","type":"prefix","backend":"b:80","shard":"ignored"}
        ]}}"#;
        let parsed = RoutingTable::parse(payload).unwrap();
        assert_eq!(parsed.hosts["a.example.com"][0].priority, 1000);
    }

    #[test]
    fn compile_rejects_invalid_regex() {
        let t = table("a.example.com", vec![route("([", RouteKind::Regex, 1000)]);
        let err = CompiledTable::compile(t).unwrap_err();
        assert_eq!(err.host, "a.example.com");
        assert_eq!(err.pattern, "([");
    }

    #[test]
    fn find_route_first_match_wins() {
        let mut t = table(
            "a.example.com",
            vec![
                route("/api/users", RouteKind::Exact, 1000),
                route("^/api/[0-9]+$", RouteKind::Regex, 1000),
                route("/api", RouteKind::Prefix, 1000),
            ],
        );
        t.sort();
        let compiled = CompiledTable::compile(t).unwrap();

        let hit = compiled.find_route("a.example.com:443", "/api/users").unwrap();
        assert_eq!(hit.kind, RouteKind::Exact);

        let hit = compiled.find_route("a.example.com", "/api/42").unwrap();
        assert_eq!(hit.kind, RouteKind::Regex);

        let hit = compiled.find_route("a.example.com", "/api/other").unwrap();
        assert_eq!(hit.kind, RouteKind::Prefix);

        assert!(compiled.find_route("b.example.com", "/api").is_none());
        assert!(compiled.find_route("a.example.com", "/nope").is_none());
    }

    #[test]
    fn exact_match_normalizes_trailing_slash() {
        let t = table("h", vec![route("/health", RouteKind::Exact, 1000)]);
        let compiled = CompiledTable::compile(t).unwrap();
        assert!(compiled.find_route("h", "/health/").is_some());
        assert!(compiled.find_route("h", "/health/x").is_none());
    }
}
