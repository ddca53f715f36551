//! Admission-time overlap detection between CustomHTTPRoutes and gateway-API
//! HTTPRoutes.
//!
//! Two routes conflict when they share a hostname and declare route matches
//! that could select the same HTTP request. The comparison is a projection
//! onto `(path kind, normalized path, method, headers, query params)`; an
//! absent method/header/param set matches all requests and is compatible
//! with anything.

use anyhow::{bail, Result};
use customrouter_core::normalize_path;
use customrouter_k8s_api::{self as api, gateway, ResourceExt};
use std::collections::HashSet;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectedKind {
    Exact,
    Prefix,
    Regex,
}

/// The tuple used to decide whether two route matches overlap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub kind: ProjectedKind,
    pub path: String,
    /// Empty means "all methods".
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub query_params: Vec<(String, String)>,
}

impl fmt::Display for ProjectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => "Exact".fmt(f),
            Self::Prefix => "PathPrefix".fmt(f),
            Self::Regex => "Regex".fmt(f),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.method.is_empty() {
            write!(f, "{} ", self.method)?;
        }
        write!(f, "{}:{}", self.kind, self.path)?;
        if !self.headers.is_empty() {
            let hdrs: Vec<String> = self
                .headers
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect();
            write!(f, " headers[{}]", hdrs.join(","))?;
        }
        if !self.query_params.is_empty() {
            let qps: Vec<String> = self
                .query_params
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect();
            write!(f, " params[{}]", qps.join(","))?;
        }
        Ok(())
    }
}

impl Projection {
    fn path_only(kind: ProjectedKind, path: &str) -> Self {
        Self {
            kind,
            path: normalize_path(path).to_string(),
            method: String::new(),
            headers: vec![],
            query_params: vec![],
        }
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.path == other.path
            && methods_compatible(&self.method, &other.method)
            && pairs_compatible(&self.headers, &other.headers)
            && pairs_compatible(&self.query_params, &other.query_params)
    }
}

/// An empty method matches all methods; two set methods must agree
/// case-insensitively.
fn methods_compatible(a: &str, b: &str) -> bool {
    a.is_empty() || b.is_empty() || a.eq_ignore_ascii_case(b)
}

/// An empty set matches all requests. Two non-empty sets are incompatible
/// only when they require different values for the same name
/// (case-insensitive).
fn pairs_compatible(a: &[(String, String)], b: &[(String, String)]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    for (name, value) in a {
        if let Some((_, other)) = b
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            if other != value {
                return false;
            }
        }
    }
    true
}

/// Projects a CustomHTTPRoute's matches. Method, header, and query-param
/// matching are not part of that API, so those fields are always empty and
/// match all requests. Duplicate `(kind, path)` pairs are collapsed.
pub fn custom_route_projections(spec: &api::CustomHttpRouteSpec) -> Vec<Projection> {
    let mut seen = HashSet::new();
    let mut projections = Vec::new();
    for rule in &spec.rules {
        for m in &rule.matches {
            let kind = match m.match_type {
                api::MatchType::Exact => ProjectedKind::Exact,
                api::MatchType::PathPrefix => ProjectedKind::Prefix,
                api::MatchType::Regex => ProjectedKind::Regex,
            };
            let path = normalize_path(&m.path).to_string();
            if seen.insert((kind as u8, path.clone())) {
                projections.push(Projection::path_only(kind, &path));
            }
        }
    }
    projections
}

/// Projects a gateway-API HTTPRoute's matches, including method, header, and
/// query-param criteria. A rule with no matches is the gateway-API catch-all
/// `(PathPrefix, "/")`, as is a route with no rules.
pub fn gateway_route_projections(spec: &gateway::HttpRouteSpec) -> Vec<Projection> {
    let catch_all = || Projection::path_only(ProjectedKind::Prefix, "/");

    let Some(rules) = spec.rules.as_ref().filter(|r| !r.is_empty()) else {
        return vec![catch_all()];
    };

    let mut projections = Vec::new();
    for rule in rules {
        let Some(matches) = rule.matches.as_ref().filter(|m| !m.is_empty()) else {
            projections.push(catch_all());
            continue;
        };
        for m in matches {
            let mut projection = catch_all();
            if let Some(path) = &m.path {
                if let Some(t) = &path.match_type {
                    projection.kind = match t.as_str() {
                        "Exact" => ProjectedKind::Exact,
                        "RegularExpression" => ProjectedKind::Regex,
                        _ => ProjectedKind::Prefix,
                    };
                }
                if let Some(value) = &path.value {
                    projection.path = normalize_path(value).to_string();
                }
            }
            if let Some(method) = &m.method {
                projection.method = method.clone();
            }
            if let Some(headers) = &m.headers {
                projection.headers = headers
                    .iter()
                    .map(|h| (h.name.clone(), h.value.clone()))
                    .collect();
                projection
                    .headers
                    .sort_by(|(a, _), (b, _)| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()));
            }
            if let Some(params) = &m.query_params {
                projection.query_params = params
                    .iter()
                    .map(|q| (q.name.clone(), q.value.clone()))
                    .collect();
                projection
                    .query_params
                    .sort_by(|(a, _), (b, _)| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()));
            }
            projections.push(projection);
        }
    }
    projections
}

/// Returns the projections of `a` that overlap some projection of `b`.
pub fn find_overlap<'p>(a: &'p [Projection], b: &[Projection]) -> Vec<&'p Projection> {
    a.iter()
        .filter(|pa| b.iter().any(|pb| pa.overlaps(pb)))
        .collect()
}

fn hostname_overlap<'h>(a: &'h [String], b: &[String]) -> Vec<&'h str> {
    let set: HashSet<&str> = b.iter().map(String::as_str).collect();
    a.iter()
        .map(String::as_str)
        .filter(|h| set.contains(h))
        .collect()
}

fn format_projections(projections: &[&Projection]) -> String {
    projections
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks a candidate CustomHTTPRoute against the live population. `uid`
/// excludes the candidate itself so updates do not self-conflict.
pub fn check_custom_route(
    candidate: &api::CustomHttpRouteSpec,
    uid: Option<&str>,
    custom_routes: &[api::CustomHttpRoute],
    gateway_routes: &[gateway::HttpRoute],
) -> Result<()> {
    if candidate.hostnames.is_empty() {
        return Ok(());
    }
    let projections = custom_route_projections(candidate);

    for other in custom_routes {
        if uid.is_some() && other.metadata.uid.as_deref() == uid {
            continue;
        }
        // Routes feeding different engines never conflict.
        if other.spec.target_ref.name != candidate.target_ref.name {
            continue;
        }
        let hosts = hostname_overlap(&candidate.hostnames, &other.spec.hostnames);
        if hosts.is_empty() {
            continue;
        }
        let other_projections = custom_route_projections(&other.spec);
        let overlap = find_overlap(&projections, &other_projections);
        if !overlap.is_empty() {
            bail!(
                "route conflict on hostnames {:?}: [{}] already defined in CustomHTTPRoute {}/{} (target {:?})",
                hosts,
                format_projections(&overlap),
                other.namespace().unwrap_or_default(),
                other.name_any(),
                candidate.target_ref.name,
            );
        }
    }

    for hr in gateway_routes {
        let Some(hr_hostnames) = hr.spec.hostnames.as_ref().filter(|h| !h.is_empty()) else {
            continue;
        };
        let hosts = hostname_overlap(&candidate.hostnames, hr_hostnames);
        if hosts.is_empty() {
            continue;
        }
        let hr_projections = gateway_route_projections(&hr.spec);
        let overlap = find_overlap(&projections, &hr_projections);
        if !overlap.is_empty() {
            bail!(
                "route conflict on hostnames {:?}: [{}] already defined in HTTPRoute {}/{}",
                hosts,
                format_projections(&overlap),
                hr.namespace().unwrap_or_default(),
                hr.name_any(),
            );
        }
    }

    Ok(())
}

/// Checks a candidate gateway-API HTTPRoute against existing
/// CustomHTTPRoutes (the symmetric direction of [`check_custom_route`]).
pub fn check_gateway_route(
    candidate: &gateway::HttpRouteSpec,
    custom_routes: &[api::CustomHttpRoute],
) -> Result<()> {
    let Some(hostnames) = candidate.hostnames.as_ref().filter(|h| !h.is_empty()) else {
        return Ok(());
    };
    let projections = gateway_route_projections(candidate);

    for cr in custom_routes {
        let hosts = hostname_overlap(hostnames, &cr.spec.hostnames);
        if hosts.is_empty() {
            continue;
        }
        let cr_projections = custom_route_projections(&cr.spec);
        let overlap = find_overlap(&projections, &cr_projections);
        if !overlap.is_empty() {
            bail!(
                "route conflict on hostnames {:?}: [{}] already defined in CustomHTTPRoute {}/{}",
                hosts,
                format_projections(&overlap),
                cr.namespace().unwrap_or_default(),
                cr.name_any(),
            );
        }
    }
    Ok(())
}
