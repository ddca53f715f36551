use crate::{index::conflict, k8s};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use crate::k8s::gateway;
use kube::{api::ListParams, core::DynamicObject, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The admission webhook: one entry point per routed kind. Denied operations
/// never reach the store, so admission errors never surface via status.
#[derive(Clone)]
pub struct Admission {
    client: k8s::Client,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not buffer admission request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("could not serialize admission review: {0}")]
    Encode(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type Operation = kube::core::admission::Operation;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        Box::pin(self.clone().handle(req))
    }
}

impl Admission {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    /// Serves one webhook call: everything that is not a review POSTed to
    /// the root path is a 404; a malformed review is answered with an
    /// "invalid" response rather than an HTTP error so the API server gets
    /// a reason it can record.
    async fn handle(self, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Error> {
        debug!(method = %req.method(), path = %req.uri().path(), "Admission request");
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            let rsp = Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("static response is well-formed");
            return Ok(rsp);
        }

        let body = req.into_body().collect().await?.to_bytes();
        let review = match serde_json::from_slice::<Review>(&body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Admission review body is not valid JSON");
                return encode_review(AdmissionResponse::invalid(error));
            }
        };

        let rsp = match review.try_into() {
            Ok(req) => self.admit(req).await,
            Err(error) => {
                warn!(%error, "Malformed admission review");
                AdmissionResponse::invalid(error)
            }
        };
        encode_review(rsp)
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        // Deletion never conflicts with anything.
        if matches!(req.operation, Operation::Delete) {
            return AdmissionResponse::from(&req);
        }

        if is_kind::<k8s::CustomHttpRoute>(&req) {
            return self.admit_custom_route(req).await;
        }

        if is_kind::<gateway::HttpRoute>(&req) {
            return self.admit_gateway_route(req).await;
        }

        AdmissionResponse::invalid(format!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_custom_route(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let (ns, name, uid, spec) = match parse_spec::<k8s::CustomHttpRouteSpec>(req) {
            Ok(parsed) => parsed,
            Err(error) => return AdmissionResponse::invalid(error),
        };

        match self.validate_custom_route(&spec, uid.as_deref()).await {
            Ok(()) => rsp,
            Err(error) => {
                info!(%error, %ns, %name, "Denied CustomHTTPRoute");
                rsp.deny(error)
            }
        }
    }

    async fn validate_custom_route(
        &self,
        spec: &k8s::CustomHttpRouteSpec,
        uid: Option<&str>,
    ) -> Result<()> {
        spec.validate()?;

        let custom_routes = self.list_custom_routes().await?;
        let gateway_routes = self.list_gateway_routes().await;
        conflict::check_custom_route(spec, uid, &custom_routes, &gateway_routes)
    }

    async fn admit_gateway_route(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let (ns, name, _uid, spec) = match parse_spec::<gateway::HttpRouteSpec>(req) {
            Ok(parsed) => parsed,
            Err(error) => return AdmissionResponse::invalid(error),
        };

        let custom_routes = match self.list_custom_routes().await {
            Ok(routes) => routes,
            Err(error) => return AdmissionResponse::invalid(error),
        };
        match conflict::check_gateway_route(&spec, &custom_routes) {
            Ok(()) => rsp,
            Err(error) => {
                info!(%error, %ns, %name, "Denied HTTPRoute");
                rsp.deny(error)
            }
        }
    }

    async fn list_custom_routes(&self) -> Result<Vec<k8s::CustomHttpRoute>> {
        let api = k8s::Api::<k8s::CustomHttpRoute>::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Gateway-API HTTPRoutes may not be installed in the cluster; treat
    /// that as an empty population rather than failing admission.
    async fn list_gateway_routes(&self) -> Vec<gateway::HttpRoute> {
        let api = k8s::Api::<gateway::HttpRoute>::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(error) => {
                warn!(%error, "Failed to list HTTPRoutes; skipping gateway conflict checks");
                Vec::new()
            }
        }
    }
}

/// Wraps an admission response into a review and encodes it for the wire.
fn encode_review(rsp: AdmissionResponse) -> Result<Response<Body>, Error> {
    let body = serde_json::to_vec(&rsp.into_review())?;
    let rsp = Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("review response is well-formed");
    Ok(rsp)
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    *req.kind.group == *T::group(&dt) && *req.kind.kind == *T::kind(&dt)
}

fn parse_spec<T: DeserializeOwned>(
    req: AdmissionRequest,
) -> Result<(String, String, Option<String>, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;

    let ns = obj
        .namespace()
        .ok_or_else(|| anyhow!("admission request missing 'namespace'"))?;
    let name = obj.name_any();
    let uid = obj.metadata.uid.clone();

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((ns, name, uid, spec))
}
