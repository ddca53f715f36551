//! Per-request values available to `${...}` substitution in action strings.

/// Values extracted from the request headers, used for routing decisions and
/// variable substitution.
#[derive(Clone, Debug, Default)]
pub struct RequestVars {
    /// Raw `:authority`, possibly carrying a port.
    pub authority: String,
    /// Raw `:path`, including any query string.
    pub path: String,
    /// The path component alone.
    pub path_only: String,
    /// The query string with its leading `?`, when present.
    pub query: String,
    pub method: String,
    pub scheme: String,
    /// First entry of `x-forwarded-for`.
    pub client_ip: String,
    pub request_id: String,
    segments: Vec<String>,
}

impl RequestVars {
    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
        match path.split_once('?') {
            Some((p, q)) => {
                self.path_only = p.to_string();
                self.query = format!("?{q}");
            }
            None => {
                self.path_only = path.to_string();
                self.query = String::new();
            }
        }
        self.segments = self
            .path_only
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    /// Replaces known `${...}` placeholders; unknown placeholders are left
    /// literal.
    pub fn substitute(&self, value: &str) -> String {
        if value.is_empty() || !value.contains("${") {
            return value.to_string();
        }
        let mut result = value
            .replace("${client_ip}", &self.client_ip)
            .replace("${request_id}", &self.request_id)
            .replace("${host}", &self.authority)
            .replace("${path}", &self.path_only)
            .replace("${method}", &self.method)
            .replace("${scheme}", &self.scheme);
        for (i, segment) in self.segments.iter().enumerate() {
            result = result.replace(&format!("${{path.segment.{i}}}"), segment);
        }
        result
    }
}

/// First IP of a comma-separated `x-forwarded-for` list.
pub fn first_forwarded_ip(xff: &str) -> &str {
    xff.split(',').next().unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> RequestVars {
        let mut vars = RequestVars {
            authority: "a.example.com:443".to_string(),
            method: "GET".to_string(),
            scheme: "https".to_string(),
            client_ip: "10.1.2.3".to_string(),
            request_id: "req-1".to_string(),
            ..Default::default()
        };
        vars.set_path("/users/42/profile?tab=posts");
        vars
    }

    #[test]
    fn splits_query_and_segments() {
        let vars = vars();
        assert_eq!(vars.path_only, "/users/42/profile");
        assert_eq!(vars.query, "?tab=posts");
    }

    #[test]
    fn substitutes_known_variables() {
        let vars = vars();
        assert_eq!(
            vars.substitute("/v2${path}?ip=${client_ip}&m=${method}"),
            "/v2/users/42/profile?ip=10.1.2.3&m=GET"
        );
        assert_eq!(vars.substitute("${scheme}://${host}"), "https://a.example.com:443");
        assert_eq!(vars.substitute("${request_id}"), "req-1");
    }

    #[test]
    fn substitutes_path_segments() {
        let vars = vars();
        assert_eq!(
            vars.substitute("/api/${path.segment.1}/${path.segment.0}"),
            "/api/42/users"
        );
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let vars = vars();
        assert_eq!(vars.substitute("/x/${unknown}"), "/x/${unknown}");
        assert_eq!(vars.substitute("/x/${path.segment.9}"), "/x/${path.segment.9}");
    }

    #[test]
    fn forwarded_ip_takes_first_entry() {
        assert_eq!(first_forwarded_ip("10.0.0.1, 10.0.0.2"), "10.0.0.1");
        assert_eq!(first_forwarded_ip(" 10.0.0.1 "), "10.0.0.1");
        assert_eq!(first_forwarded_ip(""), "");
    }
}
