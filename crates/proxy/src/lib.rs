//! hindsight proxy: an API-server front that serves bundle data back to
//! ordinary Kubernetes clients.
//!
//! Requests are forwarded to the backend. Successful JSON responses pass
//! through the rewriter's serving hook so clients see objects as they were
//! recorded, and pod logs are answered from the bundle directly.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use hindsight_bundle::Bundle;
use hindsight_rewrite::ResourceRewriter;
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, info, warn};

mod intercept;
mod logs;
mod server;
mod watch;

pub use intercept::{is_gzip, rewrite_body, rewrite_json, should_intercept};
pub use logs::{backfill_timestamps, find_pod_log, pod_logs, LogQuery};
pub use server::serve;
pub use watch::{is_watch, rewrite_event, rewrite_watch_stream};

/// Default cap on buffered request bodies.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

pub const LOG_ROUTE: &str = "/api/v1/namespaces/{namespace}/pods/{pod}/log";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("building upstream request: {0}")]
    Request(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    Kube(#[from] kube::Error),
}

/// Where forwarded requests go.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// `req` carries a path-and-query URI; the upstream supplies the origin
    /// and credentials.
    async fn send(&self, req: http::Request<Bytes>) -> Result<http::Response<Body>, UpstreamError>;
}

/// Forwards through a `kube::Client`, which owns the backend address and
/// credentials.
#[derive(Clone)]
pub struct KubeUpstream {
    client: kube::Client,
}

impl KubeUpstream {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for KubeUpstream {
    async fn send(&self, req: http::Request<Bytes>) -> Result<http::Response<Body>, UpstreamError> {
        let (parts, body) = req.into_parts();
        let req = http::Request::from_parts(parts, kube::client::Body::from(body.to_vec()));
        let resp = self.client.send(req).await?;
        Ok(resp.map(Body::new))
    }
}

#[derive(Clone)]
pub struct ProxyState {
    pub bundle: Arc<dyn Bundle>,
    pub rewriter: Arc<dyn ResourceRewriter>,
    pub upstream: Arc<dyn Upstream>,
    pub max_request_bytes: usize,
}

impl ProxyState {
    pub fn new(bundle: Arc<dyn Bundle>, rewriter: Arc<dyn ResourceRewriter>, upstream: Arc<dyn Upstream>) -> Self {
        let max_request_bytes = std::env::var("HINDSIGHT_MAX_REQUEST_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
        Self { bundle, rewriter, upstream, max_request_bytes }
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(LOG_ROUTE, get(pod_logs))
        .fallback(forward)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();
    let resp = next.run(req).await;
    let status = resp.status();
    info!(status = status.as_u16(), method = %method, uri = %uri, elapsed_ms = started.elapsed().as_millis() as u64, "request");
    counter!("proxy_requests_total", "code" => status.as_u16().to_string()).increment(1);
    resp
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for h in HOP_BY_HOP.iter() {
        headers.remove(h);
    }
    headers.remove("keep-alive");
}

fn upstream_request(req: &http::request::Parts, body: Bytes) -> Result<http::Request<Bytes>, http::Error> {
    let path = req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut out = http::Request::builder().method(req.method.clone()).uri(path).body(body)?;
    let headers = out.headers_mut();
    for (name, value) in req.headers.iter() {
        if name == header::HOST || name == header::AUTHORIZATION || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    strip_hop_by_hop(headers);
    headers.remove(header::TRANSFER_ENCODING);
    Ok(out)
}

fn bad_gateway(error: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_GATEWAY, format!("upstream request failed: {}", error)).into_response()
}

/// Forwards a request to the backend and rewrites the objects in its response.
pub async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.max_request_bytes).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };
    let watch = is_watch(&parts.uri);
    let outbound = match upstream_request(&parts, body) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let resp = match state.upstream.send(outbound).await {
        Ok(r) => r,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "forwarding failed");
            return bad_gateway(e);
        }
    };

    let (mut head, body) = resp.into_parts();
    strip_hop_by_hop(&mut head.headers);
    if !should_intercept(head.status, &head.headers) {
        return Response::from_parts(head, body);
    }
    if watch {
        if is_gzip(&head.headers) {
            debug!(uri = %parts.uri, "compressed watch stream passed through");
            return Response::from_parts(head, body);
        }
        head.headers.remove(header::CONTENT_LENGTH);
        let events = rewrite_watch_stream(state.rewriter.clone(), body.into_data_stream());
        return Response::from_parts(head, Body::from_stream(events));
    }

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "reading upstream response failed");
            return bad_gateway(e);
        }
    };
    let out = rewrite_body(state.rewriter.as_ref(), &mut head.headers, bytes);
    Response::from_parts(head, Body::from(out))
}
