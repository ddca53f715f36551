use serde::{Deserialize, Serialize};

/// Priority assigned to a route when the source match does not set one.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// How a route's `path` is compared against a request path.
///
/// The derived `Ord` is the tie-break order used by [`sort_routes`]: an exact
/// match beats a regex, which beats a prefix, when priorities are equal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Exact,
    Regex,
    Prefix,
}

/// A transformation applied to a matched request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    #[serde(rename_all = "camelCase")]
    Redirect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheme: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default = "default_redirect_status")]
        status_code: u16,
    },

    #[serde(rename_all = "camelCase")]
    Rewrite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace_prefix_match: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    HeaderSet { name: String, value: String },

    #[serde(rename_all = "camelCase")]
    HeaderAdd { name: String, value: String },

    #[serde(rename_all = "camelCase")]
    HeaderRemove { name: String },
}

fn default_redirect_status() -> u16 {
    302
}

/// A single flattened routing-table row.
///
/// `backend` is the canonical origin string `host:port`, where `host` is
/// either `svc.ns.svc.cluster.local` or a literal DNS name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: RouteKind,
    pub backend: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Regex => "regex",
            Self::Prefix => "prefix",
        }
    }
}

impl Route {
    /// Splits `backend` into host and port, defaulting the port to 80.
    pub fn parse_backend(&self) -> (&str, u16) {
        match self.backend.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (self.backend.as_str(), 80),
            },
            None => (self.backend.as_str(), 80),
        }
    }

    /// Returns the first redirect action, if any. Redirects short-circuit
    /// request processing regardless of their position in the action list.
    pub fn redirect(&self) -> Option<&Action> {
        self.actions
            .iter()
            .find(|a| matches!(a, Action::Redirect { .. }))
    }
}

/// Strips exactly one trailing `/` from paths longer than `/` itself, so
/// `/api` and `/api/` compare equal without collapsing the root path.
pub fn normalize_path(p: &str) -> &str {
    if p.len() > 1 && p.ends_with('/') {
        &p[..p.len() - 1]
    } else {
        p
    }
}

/// Removes a port suffix from an authority, leaving bracketed IPv6 literals
/// and bare (multi-colon) IPv6 addresses intact.
pub fn strip_port(authority: &str) -> &str {
    let Some(idx) = authority.rfind(':') else {
        return authority;
    };
    if let Some(bracket) = authority.rfind(']') {
        // [::1]:8080 -> [::1]; a colon inside the brackets is not a port.
        if bracket < idx {
            return &authority[..idx];
        }
        return authority;
    }
    if authority.matches(':').count() == 1 {
        return &authority[..idx];
    }
    authority
}

/// Sorts routes into the canonical evaluation order: priority descending,
/// then exact before regex before prefix, then longer paths first. The sort
/// is stable so equal rows keep their insertion order.
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| b.path.len().cmp(&a.path.len()))
    });
}
