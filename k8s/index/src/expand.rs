//! Expands a `CustomHTTPRoute` spec into flattened routing-table rows.

use customrouter_core::{sort_routes, Action, Route, RouteKind, DEFAULT_PRIORITY};
use customrouter_k8s_api as api;
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound on the number of rows a single spec may generate.
pub const MAX_ROUTES_PER_SPEC: usize = 500_000;

/// The sentinel substituted inline when a regex opts into prefix expansion
/// explicitly.
const PREFIX_SENTINEL: &str = "{prefix}";

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error(
        "route would generate ~{estimate} rows (limit {limit}): reduce hostnames, rules, matches, or prefixes"
    )]
    RouteExplosion { estimate: usize, limit: usize },

    #[error("rewritten regex {pattern:?} does not compile: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl ExpandError {
    /// The status condition reason reported for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RouteExplosion { .. } => "ExplosionLimit",
            Self::InvalidRegex { .. } => "RegexCompileError",
        }
    }
}

/// Expands a spec into per-host route lists, sorted in canonical order.
pub fn expand_routes(
    spec: &api::CustomHttpRouteSpec,
) -> Result<BTreeMap<String, Vec<Route>>, ExpandError> {
    let prefixes = spec
        .path_prefixes
        .as_ref()
        .map(|p| p.values.as_slice())
        .unwrap_or_default();

    let total_matches: usize = spec.rules.iter().map(|r| r.matches.len()).sum();
    let estimate = spec.hostnames.len() * total_matches * (prefixes.len() + 1);
    if estimate > MAX_ROUTES_PER_SPEC {
        return Err(ExpandError::RouteExplosion {
            estimate,
            limit: MAX_ROUTES_PER_SPEC,
        });
    }

    let mut per_rule = Vec::with_capacity(spec.rules.len());
    for rule in &spec.rules {
        per_rule.push(expand_rule(spec.path_prefixes.as_ref(), rule)?);
    }

    let mut hosts = BTreeMap::new();
    for hostname in &spec.hostnames {
        let mut routes: Vec<Route> = per_rule.iter().flatten().cloned().collect();
        sort_routes(&mut routes);
        hosts.insert(hostname.clone(), routes);
    }
    Ok(hosts)
}

fn expand_rule(
    spec_prefixes: Option<&api::PathPrefixes>,
    rule: &api::Rule,
) -> Result<Vec<Route>, ExpandError> {
    let policy = effective_policy(spec_prefixes, rule);
    let expand_types = effective_expand_types(spec_prefixes, rule);
    let prefixes = spec_prefixes.map(|p| p.values.as_slice()).unwrap_or_default();

    let backend = backend_string(&rule.backend_refs);
    let actions = convert_actions(&rule.actions);

    let mut routes = Vec::new();
    for m in &rule.matches {
        let kind = route_kind(m.match_type);
        let priority = m.priority.unwrap_or(DEFAULT_PRIORITY);
        let mk = |path: String| Route {
            path,
            kind,
            backend: backend.clone(),
            priority,
            actions: actions.clone(),
        };

        if !should_expand(m.match_type, expand_types) {
            routes.push(mk(m.path.clone()));
            continue;
        }

        if m.match_type == api::MatchType::Regex {
            let pattern = expand_regex_with_prefixes(&m.path, prefixes, policy);
            regex::Regex::new(&pattern).map_err(|source| ExpandError::InvalidRegex {
                pattern: pattern.clone(),
                source,
            })?;
            routes.push(mk(pattern));
            continue;
        }

        // Exact and PathPrefix expand into separate rows per prefix.
        match policy {
            api::PathPrefixPolicy::Disabled => routes.push(mk(m.path.clone())),
            api::PathPrefixPolicy::Required => {
                for prefix in prefixes {
                    routes.push(mk(format!("/{prefix}{}", m.path)));
                }
            }
            api::PathPrefixPolicy::Optional => {
                for prefix in prefixes {
                    routes.push(mk(format!("/{prefix}{}", m.path)));
                }
                routes.push(mk(m.path.clone()));
            }
        }
    }
    Ok(routes)
}

fn route_kind(t: api::MatchType) -> RouteKind {
    match t {
        api::MatchType::Exact => RouteKind::Exact,
        api::MatchType::Regex => RouteKind::Regex,
        api::MatchType::PathPrefix => RouteKind::Prefix,
    }
}

fn effective_policy(
    spec_prefixes: Option<&api::PathPrefixes>,
    rule: &api::Rule,
) -> api::PathPrefixPolicy {
    if let Some(overrides) = &rule.path_prefixes {
        return overrides.policy;
    }
    spec_prefixes.map(|p| p.policy).unwrap_or_default()
}

/// Rule-level override beats spec-level config; an empty list means every
/// match type is eligible.
fn effective_expand_types<'r>(
    spec_prefixes: Option<&'r api::PathPrefixes>,
    rule: &'r api::Rule,
) -> &'r [api::MatchType] {
    if let Some(overrides) = &rule.path_prefixes {
        if !overrides.expand_match_types.is_empty() {
            return &overrides.expand_match_types;
        }
    }
    match spec_prefixes {
        Some(p) if !p.expand_match_types.is_empty() => &p.expand_match_types,
        _ => &[],
    }
}

fn should_expand(t: api::MatchType, expand_types: &[api::MatchType]) -> bool {
    expand_types.is_empty() || expand_types.contains(&t)
}

fn backend_string(refs: &[api::BackendRef]) -> String {
    let Some(backend) = refs.first() else {
        return String::new();
    };
    // A dotted name is a literal DNS host; the namespace plays no part in
    // address derivation.
    if backend.name.contains('.') {
        format!("{}:{}", backend.name, backend.port)
    } else {
        format!(
            "{}.{}.svc.cluster.local:{}",
            backend.name, backend.namespace, backend.port
        )
    }
}

fn convert_actions(actions: &[api::Action]) -> Vec<Action> {
    actions
        .iter()
        .filter_map(|a| match a.action_type {
            api::ActionType::Redirect => a.redirect.as_ref().map(|r| Action::Redirect {
                scheme: r.scheme.clone(),
                hostname: r.hostname.clone(),
                path: r.path.clone(),
                port: r.port,
                status_code: r.status_code.unwrap_or(302),
            }),
            api::ActionType::Rewrite => a.rewrite.as_ref().map(|r| Action::Rewrite {
                path: r.path.clone(),
                hostname: r.hostname.clone(),
                replace_prefix_match: r.replace_prefix_match,
            }),
            api::ActionType::HeaderSet => a.header.as_ref().map(|h| Action::HeaderSet {
                name: h.name.clone(),
                value: h.value.clone(),
            }),
            api::ActionType::HeaderAdd => a.header.as_ref().map(|h| Action::HeaderAdd {
                name: h.name.clone(),
                value: h.value.clone(),
            }),
            api::ActionType::HeaderRemove => a.header_name.clone().map(|name| Action::HeaderRemove { name }),
        })
        .collect()
}

/// Rewrites a regex pattern so it also matches prefixed paths, without
/// breaking the expression.
///
/// With the `{prefix}` sentinel present, the alternation group is substituted
/// inline (`L` for Required, `L?` for Optional). Otherwise the group is
/// inserted after an optional `^` anchor, and only when the remaining pattern
/// is rooted at `/`; unrooted patterns are returned unchanged.
pub fn expand_regex_with_prefixes(
    pattern: &str,
    prefixes: &[String],
    policy: api::PathPrefixPolicy,
) -> String {
    if policy == api::PathPrefixPolicy::Disabled || prefixes.is_empty() {
        return pattern.to_string();
    }

    let group = format!("({})", prefixes.join("|"));

    if pattern.contains(PREFIX_SENTINEL) {
        return match policy {
            api::PathPrefixPolicy::Required => pattern.replace(PREFIX_SENTINEL, &group),
            api::PathPrefixPolicy::Optional => {
                pattern.replace(PREFIX_SENTINEL, &format!("{group}?"))
            }
            api::PathPrefixPolicy::Disabled => pattern.to_string(),
        };
    }

    let (anchor, tail) = match pattern.strip_prefix('^') {
        Some(tail) => ("^", tail),
        None => ("", pattern),
    };
    if !tail.starts_with('/') {
        return pattern.to_string();
    }

    match policy {
        api::PathPrefixPolicy::Required => format!("{anchor}/{group}{tail}"),
        api::PathPrefixPolicy::Optional => format!("{anchor}(?:/{group})?{tail}"),
        api::PathPrefixPolicy::Disabled => pattern.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> api::BackendRef {
        api::BackendRef {
            name: "health".to_string(),
            namespace: "infra".to_string(),
            port: 8080,
        }
    }

    fn match_of(path: &str, t: api::MatchType, priority: Option<i32>) -> api::PathMatch {
        api::PathMatch {
            path: path.to_string(),
            match_type: t,
            priority,
        }
    }

    fn spec(
        hostnames: &[&str],
        path_prefixes: Option<api::PathPrefixes>,
        rules: Vec<api::Rule>,
    ) -> api::CustomHttpRouteSpec {
        api::CustomHttpRouteSpec {
            target_ref: api::TargetRef {
                name: "default".to_string(),
            },
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            path_prefixes,
            catch_all_route: None,
            rules,
        }
    }

    fn rule(matches: Vec<api::PathMatch>) -> api::Rule {
        api::Rule {
            matches,
            actions: vec![],
            backend_refs: vec![backend()],
            path_prefixes: None,
        }
    }

    fn prefixes(values: &[&str], policy: api::PathPrefixPolicy) -> api::PathPrefixes {
        api::PathPrefixes {
            values: values.iter().map(|v| v.to_string()).collect(),
            policy,
            expand_match_types: vec![],
        }
    }

    #[test]
    fn simple_route_without_prefixes() {
        let s = spec(
            &["a.example.com"],
            None,
            vec![rule(vec![match_of("/health", api::MatchType::Exact, Some(2000))])],
        );
        let hosts = expand_routes(&s).unwrap();
        let routes = &hosts["a.example.com"];
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/health");
        assert_eq!(routes[0].kind, RouteKind::Exact);
        assert_eq!(routes[0].backend, "health.infra.svc.cluster.local:8080");
        assert_eq!(routes[0].priority, 2000);
        assert!(routes[0].actions.is_empty());
    }

    #[test]
    fn optional_prefix_expansion_orders_prefixed_first() {
        let s = spec(
            &["a.example.com"],
            Some(prefixes(&["es", "fr"], api::PathPrefixPolicy::Optional)),
            vec![rule(vec![match_of("/api", api::MatchType::PathPrefix, None)])],
        );
        let hosts = expand_routes(&s).unwrap();
        let paths: Vec<_> = hosts["a.example.com"].iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/es/api", "/fr/api", "/api"]);
        assert!(hosts["a.example.com"]
            .iter()
            .all(|r| r.kind == RouteKind::Prefix && r.priority == 1000));
    }

    #[test]
    fn required_prefix_expansion_omits_bare_path() {
        let s = spec(
            &["a.example.com"],
            Some(prefixes(&["es"], api::PathPrefixPolicy::Required)),
            vec![rule(vec![match_of("/api", api::MatchType::PathPrefix, None)])],
        );
        let hosts = expand_routes(&s).unwrap();
        let paths: Vec<_> = hosts["a.example.com"].iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/es/api"]);
    }

    #[test]
    fn regex_required_rewriting() {
        let s = spec(
            &["a.example.com"],
            Some(prefixes(&["es", "fr", "it"], api::PathPrefixPolicy::Required)),
            vec![rule(vec![match_of(
                "^/users/[0-9]+$",
                api::MatchType::Regex,
                None,
            )])],
        );
        let hosts = expand_routes(&s).unwrap();
        let pattern = &hosts["a.example.com"][0].path;
        assert_eq!(pattern, "^/(es|fr|it)/users/[0-9]+$");

        let re = regex::Regex::new(pattern).unwrap();
        assert!(re.is_match("/es/users/42"));
        assert!(!re.is_match("/users/42"));
    }

    #[test]
    fn regex_optional_rewriting_matches_both_forms() {
        let rewritten = expand_regex_with_prefixes(
            "^/users/[0-9]+$",
            &["es".to_string(), "fr".to_string()],
            api::PathPrefixPolicy::Optional,
        );
        assert_eq!(rewritten, "^(?:/(es|fr))?/users/[0-9]+$");
        let re = regex::Regex::new(&rewritten).unwrap();
        assert!(re.is_match("/fr/users/7"));
        assert!(re.is_match("/users/7"));
        assert!(!re.is_match("/de/users/7"));
    }

    #[test]
    fn regex_sentinel_substitution() {
        let values = vec!["es".to_string(), "fr".to_string()];
        assert_eq!(
            expand_regex_with_prefixes("^/{prefix}/x$", &values, api::PathPrefixPolicy::Required),
            "^/(es|fr)/x$"
        );
        assert_eq!(
            expand_regex_with_prefixes("^/{prefix}/x$", &values, api::PathPrefixPolicy::Optional),
            "^/(es|fr)?/x$"
        );
        assert_eq!(
            expand_regex_with_prefixes("^/{prefix}/x$", &values, api::PathPrefixPolicy::Disabled),
            "^/{prefix}/x$"
        );
    }

    #[test]
    fn unrooted_regex_is_left_unchanged() {
        let values = vec!["es".to_string()];
        assert_eq!(
            expand_regex_with_prefixes("users/[0-9]+", &values, api::PathPrefixPolicy::Required),
            "users/[0-9]+"
        );
        assert_eq!(
            expand_regex_with_prefixes("^users", &values, api::PathPrefixPolicy::Optional),
            "^users"
        );
    }

    #[test]
    fn expand_types_limit_expansion() {
        let mut cfg = prefixes(&["es"], api::PathPrefixPolicy::Optional);
        cfg.expand_match_types = vec![api::MatchType::PathPrefix];
        let s = spec(
            &["a.example.com"],
            Some(cfg),
            vec![rule(vec![
                match_of("/api", api::MatchType::PathPrefix, None),
                match_of("/health", api::MatchType::Exact, None),
            ])],
        );
        let hosts = expand_routes(&s).unwrap();
        let paths: Vec<_> = hosts["a.example.com"].iter().map(|r| r.path.as_str()).collect();
        // Only the prefix match expands; the exact match stays literal and
        // sorts first by kind.
        assert_eq!(paths, vec!["/health", "/es/api", "/api"]);
    }

    #[test]
    fn rule_override_beats_spec_policy() {
        let mut r = rule(vec![match_of("/api", api::MatchType::PathPrefix, None)]);
        r.path_prefixes = Some(api::RulePathPrefixes {
            policy: api::PathPrefixPolicy::Disabled,
            expand_match_types: vec![],
        });
        let s = spec(
            &["a.example.com"],
            Some(prefixes(&["es"], api::PathPrefixPolicy::Required)),
            vec![r],
        );
        let hosts = expand_routes(&s).unwrap();
        let paths: Vec<_> = hosts["a.example.com"].iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/api"]);
    }

    #[test]
    fn dotted_backend_name_is_literal() {
        let mut r = rule(vec![match_of("/", api::MatchType::PathPrefix, None)]);
        r.backend_refs = vec![api::BackendRef {
            name: "legacy.example.com".to_string(),
            namespace: "ignored".to_string(),
            port: 443,
        }];
        let s = spec(&["a.example.com"], None, vec![r]);
        let hosts = expand_routes(&s).unwrap();
        assert_eq!(hosts["a.example.com"][0].backend, "legacy.example.com:443");
    }

    #[test]
    fn explosion_gate() {
        let hostnames: Vec<String> = (0..100).map(|i| format!("h{i}.example.com")).collect();
        let hostname_refs: Vec<&str> = hostnames.iter().map(String::as_str).collect();
        let matches: Vec<api::PathMatch> = (0..101)
            .map(|i| match_of(&format!("/p{i}"), api::MatchType::PathPrefix, None))
            .collect();
        let s = spec(
            &hostname_refs,
            Some(prefixes(&["a"; 49], api::PathPrefixPolicy::Optional)),
            vec![rule(matches)],
        );
        // 100 hosts x 101 matches x (49 + 1) prefixes > 500_000.
        match expand_routes(&s) {
            Err(ExpandError::RouteExplosion { estimate, limit }) => {
                assert_eq!(estimate, 100 * 101 * 50);
                assert_eq!(limit, MAX_ROUTES_PER_SPEC);
            }
            other => panic!("expected explosion error, got {other:?}"),
        }
    }

    #[test]
    fn redirect_action_is_carried_onto_rows() {
        let mut r = rule(vec![match_of("/old", api::MatchType::Exact, None)]);
        r.actions = vec![api::Action {
            action_type: api::ActionType::Redirect,
            redirect: Some(api::RedirectConfig {
                path: Some("/new".to_string()),
                status_code: Some(301),
                ..Default::default()
            }),
            rewrite: None,
            header: None,
            header_name: None,
        }];
        let s = spec(&["a.example.com"], None, vec![r]);
        let hosts = expand_routes(&s).unwrap();
        match &hosts["a.example.com"][0].actions[0] {
            Action::Redirect {
                path, status_code, ..
            } => {
                assert_eq!(path.as_deref(), Some("/new"));
                assert_eq!(*status_code, 301);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
