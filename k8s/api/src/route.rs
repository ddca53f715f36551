use anyhow::{bail, Result};

/// CustomHTTPRoute declares hostname- and path-based routing intent for a
/// gateway served by an external processor. Routes sharing a
/// `spec.targetRef.name` are compiled into the same routing-table partitions.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "customrouter.io",
    version = "v1alpha1",
    kind = "CustomHTTPRoute",
    root = "CustomHttpRoute",
    status = "CustomHttpRouteStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CustomHttpRouteSpec {
    /// Identifies the external processor instance that serves these routes.
    pub target_ref: TargetRef,

    /// Hostnames this route applies to, matched against `:authority` with
    /// any port stripped.
    pub hostnames: Vec<String>,

    /// Optional prefixes (e.g. language codes) expanded into the generated
    /// routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefixes: Option<PathPrefixes>,

    /// When set, the hostnames of this route also receive a catch-all
    /// virtual host forwarding unmatched requests to the given backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_all_route: Option<CatchAllBackendRef>,

    /// Routing rules; at least one is required.
    pub rules: Vec<Rule>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct TargetRef {
    /// DNS-1123 label naming the external processor target.
    pub name: String,
}

/// How generated routes are combined with the configured path prefixes.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize,
    schemars::JsonSchema,
)]
pub enum PathPrefixPolicy {
    /// Generate routes both with and without each prefix.
    #[default]
    Optional,
    /// Generate routes only with a prefix.
    Required,
    /// Generate routes without any prefix.
    Disabled,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize,
    schemars::JsonSchema,
)]
pub enum MatchType {
    /// Matches paths starting with the given value.
    #[default]
    PathPrefix,
    /// Matches paths exactly equal to the given value.
    Exact,
    /// Matches paths against a regular expression.
    Regex,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PathPrefixes {
    /// Prefixes prepended to paths, without slashes (e.g. `["es", "fr"]`).
    #[serde(default)]
    pub values: Vec<String>,

    #[serde(default)]
    pub policy: PathPrefixPolicy,

    /// Match types eligible for expansion. Empty means all types.
    #[serde(default)]
    pub expand_match_types: Vec<MatchType>,
}

/// Per-rule override of the spec-level prefix configuration.
#[derive(
    Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct RulePathPrefixes {
    pub policy: PathPrefixPolicy,

    #[serde(default)]
    pub expand_match_types: Vec<MatchType>,
}

#[derive(
    Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    pub path: String,

    #[serde(default, rename = "type")]
    pub match_type: MatchType,

    /// Higher priorities are evaluated first; defaults to 1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Service name, or a literal DNS host when it contains a dot.
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub enum ActionType {
    #[serde(rename = "redirect")]
    Redirect,
    #[serde(rename = "rewrite")]
    Rewrite,
    #[serde(rename = "header-set")]
    HeaderSet,
    #[serde(rename = "header-add")]
    HeaderAdd,
    #[serde(rename = "header-remove")]
    HeaderRemove,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct RedirectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Redirect path; supports the engine's `${...}` variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// One of 301, 302, 303, 307, 308; defaults to 302.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct RewriteConfig {
    /// Replacement path; supports the engine's `${...}` variables. Without
    /// variables on a PathPrefix match, only the matched prefix is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Overrides the automatic prefix-vs-full rewrite inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_prefix_match: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct HeaderConfig {
    pub name: String,
    /// Header value; supports the engine's `${...}` variables.
    pub value: String,
}

#[derive(
    Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderConfig>,

    /// Header name to remove (for `header-remove`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

#[derive(
    Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub matches: Vec<PathMatch>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// Required unless `actions` contains a redirect.
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefixes: Option<RulePathPrefixes>,
}

#[derive(
    Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct CatchAllBackendRef {
    pub backend_ref: BackendRef,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct CustomHttpRouteStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

// === impl Rule ===

impl Rule {
    pub fn has_redirect_action(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.action_type == ActionType::Redirect)
    }
}

// === impl CustomHttpRouteSpec ===

impl CustomHttpRouteSpec {
    /// Structural validation run at admission, before conflict checking.
    pub fn validate(&self) -> Result<()> {
        if self.hostnames.is_empty() {
            bail!("at least one hostname is required");
        }
        if self.rules.is_empty() {
            bail!("at least one rule is required");
        }
        validate_target_name(&self.target_ref.name)?;
        for (i, rule) in self.rules.iter().enumerate() {
            validate_rule(i, rule)?;
        }
        Ok(())
    }
}

fn validate_target_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        bail!("targetRef.name {name:?} must be a DNS-1123 label");
    }
    Ok(())
}

fn validate_rule(index: usize, rule: &Rule) -> Result<()> {
    if rule.matches.is_empty() {
        bail!("rules[{index}]: at least one match is required");
    }

    if !rule.has_redirect_action() && rule.backend_refs.is_empty() {
        bail!("rules[{index}]: backendRefs is required when no redirect action is specified");
    }

    for (j, action) in rule.actions.iter().enumerate() {
        validate_action(index, j, action)?;
    }

    for (j, m) in rule.matches.iter().enumerate() {
        match m.match_type {
            MatchType::Exact | MatchType::PathPrefix => {
                if !m.path.starts_with('/') {
                    bail!("rules[{index}].matches[{j}]: path must start with '/'");
                }
            }
            MatchType::Regex => {
                // Probe the pattern the way the expander will use it: with the
                // prefix sentinel substituted by a concrete group.
                let probe = m.path.replace("{prefix}", "(test)");
                if let Err(error) = regex::Regex::new(&probe) {
                    bail!(
                        "rules[{index}].matches[{j}]: invalid regex {:?}: {error}",
                        m.path
                    );
                }
            }
        }
        if m.path.is_empty() {
            bail!("rules[{index}].matches[{j}]: path must not be empty");
        }
        if let Some(priority) = m.priority {
            if priority < 0 {
                bail!("rules[{index}].matches[{j}]: priority must not be negative");
            }
        }
    }

    Ok(())
}

fn validate_action(rule_index: usize, action_index: usize, action: &Action) -> Result<()> {
    let at = format!("rules[{rule_index}].actions[{action_index}]");
    match action.action_type {
        ActionType::Redirect => {
            let Some(redirect) = &action.redirect else {
                bail!("{at}: redirect config is required when type is 'redirect'");
            };
            if redirect.scheme.is_none()
                && redirect.hostname.is_none()
                && redirect.path.is_none()
                && redirect.port.is_none()
            {
                bail!("{at}: at least one redirect field (scheme, hostname, path, or port) must be specified");
            }
            if let Some(code) = redirect.status_code {
                if !matches!(code, 301 | 302 | 303 | 307 | 308) {
                    bail!("{at}: statusCode must be one of 301, 302, 303, 307, 308");
                }
            }
        }
        ActionType::Rewrite => {
            let Some(rewrite) = &action.rewrite else {
                bail!("{at}: rewrite config is required when type is 'rewrite'");
            };
            if rewrite.path.is_none() && rewrite.hostname.is_none() {
                bail!("{at}: at least one rewrite field (path or hostname) must be specified");
            }
        }
        ActionType::HeaderSet | ActionType::HeaderAdd => {
            let Some(header) = &action.header else {
                bail!("{at}: header config is required for header-set and header-add");
            };
            if header.name.is_empty() {
                bail!("{at}: header.name is required");
            }
        }
        ActionType::HeaderRemove => {
            if action.header_name.as_deref().unwrap_or("").is_empty() {
                bail!("{at}: headerName is required when type is 'header-remove'");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendRef {
        BackendRef {
            name: "web".to_string(),
            namespace: "apps".to_string(),
            port: 8080,
        }
    }

    fn spec(rules: Vec<Rule>) -> CustomHttpRouteSpec {
        CustomHttpRouteSpec {
            target_ref: TargetRef {
                name: "default".to_string(),
            },
            hostnames: vec!["a.example.com".to_string()],
            path_prefixes: None,
            catch_all_route: None,
            rules,
        }
    }

    fn prefix_rule(path: &str) -> Rule {
        Rule {
            matches: vec![PathMatch {
                path: path.to_string(),
                match_type: MatchType::PathPrefix,
                priority: None,
            }],
            actions: vec![],
            backend_refs: vec![backend()],
            path_prefixes: None,
        }
    }

    #[test]
    fn accepts_minimal_spec() {
        assert!(spec(vec![prefix_rule("/api")]).validate().is_ok());
    }

    #[test]
    fn rejects_rule_without_backend_or_redirect() {
        let mut rule = prefix_rule("/api");
        rule.backend_refs.clear();
        assert!(spec(vec![rule]).validate().is_err());
    }

    #[test]
    fn redirect_substitutes_for_backend() {
        let mut rule = prefix_rule("/old");
        rule.backend_refs.clear();
        rule.actions.push(Action {
            action_type: ActionType::Redirect,
            redirect: Some(RedirectConfig {
                path: Some("/new".to_string()),
                ..Default::default()
            }),
            rewrite: None,
            header: None,
            header_name: None,
        });
        assert!(spec(vec![rule]).validate().is_ok());
    }

    #[test]
    fn rejects_empty_redirect() {
        let mut rule = prefix_rule("/old");
        rule.actions.push(Action {
            action_type: ActionType::Redirect,
            redirect: Some(RedirectConfig::default()),
            rewrite: None,
            header: None,
            header_name: None,
        });
        let err = spec(vec![rule]).validate().unwrap_err().to_string();
        assert!(err.contains("at least one redirect field"), "{err}");
    }

    #[test]
    fn rejects_invalid_prefix_regex() {
        let rule = Rule {
            matches: vec![PathMatch {
                path: "^/users/{prefix}/[".to_string(),
                match_type: MatchType::Regex,
                priority: None,
            }],
            actions: vec![],
            backend_refs: vec![backend()],
            path_prefixes: None,
        };
        assert!(spec(vec![rule]).validate().is_err());
    }

    #[test]
    fn accepts_prefix_sentinel_regex() {
        let rule = Rule {
            matches: vec![PathMatch {
                path: "^/{prefix}/users/[0-9]+$".to_string(),
                match_type: MatchType::Regex,
                priority: None,
            }],
            actions: vec![],
            backend_refs: vec![backend()],
            path_prefixes: None,
        };
        assert!(spec(vec![rule]).validate().is_ok());
    }

    #[test]
    fn rejects_bad_target_names() {
        for name in ["", "Has-Caps", "-leading", "trailing-", "a".repeat(64).as_str()] {
            let mut s = spec(vec![prefix_rule("/api")]);
            s.target_ref.name = name.to_string();
            assert!(s.validate().is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn rejects_unrooted_exact_path() {
        let mut rule = prefix_rule("/ok");
        rule.matches.push(PathMatch {
            path: "api".to_string(),
            match_type: MatchType::Exact,
            priority: None,
        });
        assert!(spec(vec![rule]).validate().is_err());
    }
}
