#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod route;
pub mod table;

pub use self::{
    route::{normalize_path, sort_routes, strip_port, Action, Route, RouteKind, DEFAULT_PRIORITY},
    table::{CompiledRoute, CompiledTable, RoutingTable, TableCompileError, TABLE_VERSION},
};

/// Models routing-table lookup for the request-processing engine.
///
/// The engine is generic over this so that tests can drive it from a static
/// table while the data-plane binary backs it with a live snapshot.
pub trait RouteLookup: Send + Sync {
    /// Returns the first matching route for `(authority, path)`, if any.
    ///
    /// `authority` may carry a port; `path` must not carry a query string.
    fn find_route(&self, authority: &str, path: &str) -> Option<Route>;
}
