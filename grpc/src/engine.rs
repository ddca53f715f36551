//! Request-header processing: table lookup, variable substitution, and
//! directive construction.

use crate::vars::{first_forwarded_ip, RequestVars};
use customrouter_core::{strip_port, Action, Route, RouteKind, RouteLookup};
use envoy_types::pb::envoy::{
    config::core::v3::{header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption},
    r#type::v3::HttpStatus,
    service::ext_proc::v3::{
        processing_request, processing_response, BodyResponse, CommonResponse, HeaderMutation,
        HeadersResponse, HttpHeaders, ImmediateResponse, ProcessingRequest, ProcessingResponse,
        TrailersResponse,
    },
};
use std::time::Instant;

/// Header that steers the gateway to the selected upstream cluster.
const CLUSTER_HEADER: &str = "x-customrouter-cluster";
const ORIGINAL_AUTHORITY_HEADER: &str = "x-original-authority";
const MATCHED_PATH_HEADER: &str = "x-customrouter-matched-path";
const MATCHED_TYPE_HEADER: &str = "x-customrouter-matched-type";

/// Handles one message from the processing stream. Only request headers are
/// processed substantively; every other phase gets an empty acknowledgement.
pub(crate) fn handle_message<T: RouteLookup>(
    lookup: &T,
    req: ProcessingRequest,
    access_log: bool,
) -> Option<ProcessingResponse> {
    use processing_request::Request;
    use processing_response::Response;

    let respond = |response: Response| ProcessingResponse {
        response: Some(response),
        ..Default::default()
    };

    match req.request? {
        Request::RequestHeaders(headers) => Some(request_headers(lookup, headers, access_log)),
        Request::ResponseHeaders(_) => {
            Some(respond(Response::ResponseHeaders(HeadersResponse::default())))
        }
        Request::RequestBody(_) => Some(respond(Response::RequestBody(BodyResponse::default()))),
        Request::ResponseBody(_) => Some(respond(Response::ResponseBody(BodyResponse::default()))),
        Request::RequestTrailers(_) => {
            Some(respond(Response::RequestTrailers(TrailersResponse::default())))
        }
        Request::ResponseTrailers(_) => {
            Some(respond(Response::ResponseTrailers(TrailersResponse::default())))
        }
    }
}

fn request_headers<T: RouteLookup>(
    lookup: &T,
    headers: HttpHeaders,
    access_log: bool,
) -> ProcessingResponse {
    let started = Instant::now();
    let vars = extract_vars(&headers);

    let Some(route) = lookup.find_route(&vars.authority, &vars.path_only) else {
        // Fail open: the gateway proceeds with its own routing.
        if access_log {
            tracing::info!(
                authority = %vars.authority,
                path = %vars.path,
                method = %vars.method,
                route_found = false,
                processing_ns = started.elapsed().as_nanos() as u64,
                "access"
            );
        }
        return ProcessingResponse {
            response: Some(processing_response::Response::RequestHeaders(
                HeadersResponse::default(),
            )),
            ..Default::default()
        };
    };

    tracing::debug!(
        authority = %vars.authority,
        path = %vars.path,
        backend = %route.backend,
        matched_pattern = %route.path,
        matched_type = route.kind.as_str(),
        priority = route.priority,
        "Route matched"
    );

    // A redirect anywhere in the action list short-circuits forwarding.
    let response = match route.redirect() {
        Some(Action::Redirect {
            scheme,
            hostname,
            path,
            port,
            status_code,
        }) => redirect_response(
            scheme.as_deref(),
            hostname.as_deref(),
            path.as_deref(),
            *port,
            *status_code,
            &vars,
        ),
        _ => forward_response(&route, &vars),
    };

    if access_log {
        tracing::info!(
            authority = %vars.authority,
            backend = %route.backend,
            path = %vars.path,
            method = %vars.method,
            matched_pattern = %route.path,
            matched_type = route.kind.as_str(),
            matched_priority = route.priority,
            route_found = true,
            processing_ns = started.elapsed().as_nanos() as u64,
            "access"
        );
    }

    response
}

fn extract_vars(headers: &HttpHeaders) -> RequestVars {
    let mut vars = RequestVars::default();
    let mut path = String::new();

    for h in headers.headers.iter().flat_map(|map| map.headers.iter()) {
        let value = if !h.value.is_empty() {
            h.value.clone()
        } else {
            String::from_utf8_lossy(&h.raw_value).into_owned()
        };
        match h.key.as_str() {
            ":authority" => vars.authority = value,
            ":path" => path = value,
            ":method" => vars.method = value,
            ":scheme" => vars.scheme = value,
            "x-forwarded-for" => vars.client_ip = first_forwarded_ip(&value).to_string(),
            "x-request-id" => vars.request_id = value,
            "x-forwarded-proto" => {
                if vars.scheme.is_empty() {
                    vars.scheme = value;
                }
            }
            _ => {}
        }
    }

    if vars.scheme.is_empty() {
        vars.scheme = "https".to_string();
    }
    vars.set_path(&path);
    vars
}

fn redirect_response(
    scheme: Option<&str>,
    hostname: Option<&str>,
    path: Option<&str>,
    port: Option<u16>,
    status_code: u16,
    vars: &RequestVars,
) -> ProcessingResponse {
    let scheme = match scheme {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => vars.scheme.clone(),
    };
    let hostname = match hostname {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => strip_port(&vars.authority).to_string(),
    };
    let path = match path.map(|p| vars.substitute(p)) {
        Some(p) if !p.is_empty() => p,
        _ => vars.path.clone(),
    };
    let port = match port {
        Some(p)
            if p > 0
                && !((scheme == "http" && p == 80) || (scheme == "https" && p == 443)) =>
        {
            format!(":{p}")
        }
        _ => String::new(),
    };

    let location = format!("{scheme}://{hostname}{port}{path}");
    tracing::debug!(%location, status_code, "Redirecting");

    ProcessingResponse {
        response: Some(processing_response::Response::ImmediateResponse(
            ImmediateResponse {
                status: Some(HttpStatus {
                    code: i32::from(status_code),
                }),
                headers: Some(HeaderMutation {
                    set_headers: vec![plain_header("Location", &location)],
                    ..Default::default()
                }),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn forward_response(route: &Route, vars: &RequestVars) -> ProcessingResponse {
    let (host, port) = route.parse_backend();
    let cluster = format!("outbound|{port}||{host}");

    let mut final_authority = route.backend.clone();
    let mut final_path = vars.path.clone();

    let mut set_headers = vec![
        plain_header(CLUSTER_HEADER, &cluster),
        plain_header(ORIGINAL_AUTHORITY_HEADER, &vars.authority),
        plain_header(MATCHED_PATH_HEADER, &route.path),
        plain_header(MATCHED_TYPE_HEADER, route.kind.as_str()),
    ];
    let mut remove_headers = Vec::new();

    for action in &route.actions {
        match action {
            Action::Rewrite {
                path,
                hostname,
                replace_prefix_match,
            } => {
                if let Some(path) = path.as_deref().filter(|p| !p.is_empty()) {
                    final_path = apply_rewrite(route, path, *replace_prefix_match, vars);
                }
                if let Some(hostname) = hostname.as_deref().filter(|h| !h.is_empty()) {
                    final_authority = hostname.to_string();
                }
            }
            Action::HeaderSet { name, value } => {
                set_headers.push(overwrite_header(name, &vars.substitute(value)));
            }
            Action::HeaderAdd { name, value } => {
                set_headers.push(append_header(name, &vars.substitute(value)));
            }
            Action::HeaderRemove { name } => remove_headers.push(name.clone()),
            Action::Redirect { .. } => {}
        }
    }

    set_headers.push(overwrite_header(":authority", &final_authority));
    set_headers.push(overwrite_header("Host", &final_authority));
    if final_path != vars.path {
        set_headers.push(overwrite_header(":path", &final_path));
    }

    ProcessingResponse {
        response: Some(processing_response::Response::RequestHeaders(
            HeadersResponse {
                response: Some(CommonResponse {
                    // The gateway must re-run route selection with the
                    // mutated headers.
                    clear_route_cache: true,
                    header_mutation: Some(HeaderMutation {
                        set_headers,
                        remove_headers,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
        )),
        ..Default::default()
    }
}

/// Computes the rewritten path, preserving the query string.
///
/// Prefix rewrite (replace only the matched prefix, keep the suffix) applies
/// when `replacePrefixMatch` demands it, or by inference on a prefix-kind
/// route whose rewrite value carries no variables. Everything else replaces
/// the full path.
fn apply_rewrite(
    route: &Route,
    rewrite_path: &str,
    replace_prefix_match: Option<bool>,
    vars: &RequestVars,
) -> String {
    let substituted = vars.substitute(rewrite_path);
    let prefix_rewrite = replace_prefix_match
        .unwrap_or_else(|| route.kind == RouteKind::Prefix && !rewrite_path.contains("${"));

    if prefix_rewrite {
        if let Some(suffix) = vars.path_only.strip_prefix(route.path.as_str()) {
            return format!("{substituted}{suffix}{}", vars.query);
        }
    }
    format!("{substituted}{}", vars.query)
}

fn plain_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn overwrite_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
        ..plain_header(key, value)
    }
}

fn append_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        append_action: HeaderAppendAction::AppendIfExistsOrAdd as i32,
        ..plain_header(key, value)
    }
}
