//! The per-request dispatcher.
//!
//! Policy: extract the endpoint ID, try a local upstream connection first,
//! and only for a request that has not already been forwarded try one hop
//! to a peer. A request carrying the forward marker is never forwarded
//! again, which bounds routing to a single hop across any cluster topology.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State as AxumState;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::Router;
use piko_cluster::State;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::http::ProxiedRequest;
use crate::local::{LocalProxy, UpstreamConn};
use crate::metrics::{ProxyMetrics, ProxyMetricsSnapshot};
use crate::remote::RemoteProxy;

/// Header naming the target endpoint. Takes precedence over the Host
/// label.
pub const ENDPOINT_HEADER: &str = "x-piko-endpoint";
/// Header marking a request as already forwarded once by a peer.
pub const FORWARD_HEADER: &str = "x-piko-forward";

/// Routes inbound requests to upstream endpoints.
pub struct Proxy {
    local: LocalProxy,
    remote: RemoteProxy,
    /// Gateway timeout covering the whole routing attempt.
    timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl Proxy {
    pub fn new(state: Arc<State>, timeout: Duration) -> Proxy {
        let metrics = Arc::new(ProxyMetrics::new());
        Proxy {
            local: LocalProxy::new(state.clone(), metrics.clone()),
            remote: RemoteProxy::new(state, metrics.clone()),
            timeout,
            metrics,
        }
    }

    /// Registers an upstream connection for its endpoint.
    pub fn add_conn(&self, conn: Arc<dyn UpstreamConn>) {
        self.local.add_conn(conn);
    }

    /// Removes the upstream connection with the given identity.
    pub fn remove_conn(&self, endpoint_id: &str, addr: &str) {
        self.local.remove_conn(endpoint_id, addr);
    }

    /// Endpoint ID → connection addresses for all local upstream
    /// connections.
    pub fn conn_addrs(&self) -> HashMap<String, Vec<String>> {
        self.local.conn_addrs()
    }

    pub fn metrics(&self) -> ProxyMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Routes the request to an upstream endpoint and returns the response.
    ///
    /// Failures are mapped to synthetic responses:
    /// - missing endpoint ID: 400
    /// - endpoint not found / unreachable: 503
    /// - gateway timeout: 504
    pub async fn request(&self, req: Request<Body>) -> Response<Body> {
        let forwarded = req
            .headers()
            .get(FORWARD_HEADER)
            .map(|v| v.as_bytes() == b"true")
            .unwrap_or(false);
        if forwarded {
            self.metrics.inc_forwarded_requests();
        }

        let endpoint_id = endpoint_id_from_request(&req);
        if endpoint_id.is_empty() {
            warn!("request: missing endpoint id");
            return self.error_response(StatusCode::BAD_REQUEST, "missing piko endpoint id");
        }

        let proxied = match ProxiedRequest::from_http(req).await {
            Ok(proxied) => proxied,
            Err(e) => {
                warn!(endpoint_id, error = %e, "request: failed to read request");
                return self.error_response(StatusCode::BAD_REQUEST, "failed to read request");
            }
        };

        match tokio::time::timeout(self.timeout, self.dispatch(&endpoint_id, forwarded, proxied))
            .await
        {
            Ok(resp) => resp,
            Err(_) => {
                warn!(endpoint_id, "request: endpoint timeout");
                self.error_response(StatusCode::GATEWAY_TIMEOUT, "endpoint timeout")
            }
        }
    }

    async fn dispatch(
        &self,
        endpoint_id: &str,
        forwarded: bool,
        req: ProxiedRequest,
    ) -> Response<Body> {
        // Attempt an upstream connected to this node first.
        match self.local.request(endpoint_id, req.clone()).await {
            Ok(resp) => {
                debug!(endpoint_id, forwarded, "request: dispatched to local conn");
                return resp.into_http();
            }
            Err(ProxyError::EndpointNotFound) => {}
            Err(ProxyError::Timeout) => {
                warn!(endpoint_id, "request: endpoint timeout");
                return self.error_response(StatusCode::GATEWAY_TIMEOUT, "endpoint timeout");
            }
            Err(e) => {
                warn!(endpoint_id, error = %e, "request: endpoint unreachable");
                return self
                    .error_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint unreachable");
            }
        }

        // A request relayed by a peer is never forwarded again, even though
        // we have no connection for the endpoint.
        if forwarded {
            warn!(endpoint_id, "request: endpoint not found");
            return self.error_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint not found");
        }

        match self.remote.request(endpoint_id, req).await {
            Ok(resp) => {
                debug!(endpoint_id, "request: dispatched to remote node");
                resp.into_http()
            }
            Err(ProxyError::EndpointNotFound) => {
                warn!(endpoint_id, "request: endpoint not found");
                self.error_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint not found")
            }
            Err(ProxyError::Timeout) => {
                warn!(endpoint_id, "request: endpoint timeout");
                self.error_response(StatusCode::GATEWAY_TIMEOUT, "endpoint timeout")
            }
            Err(e) => {
                warn!(endpoint_id, error = %e, "request: endpoint unreachable");
                self.error_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint unreachable")
            }
        }
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Response<Body> {
        self.metrics.inc_errors();
        let body = serde_json::json!({ "error": message }).to_string();
        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    }
}

/// Builds the proxy-facing router: every method on every path is routed to
/// the dispatcher.
pub fn router(proxy: Arc<Proxy>) -> Router {
    Router::new().fallback(proxy_handler).with_state(proxy)
}

async fn proxy_handler(
    AxumState(proxy): AxumState<Arc<Proxy>>,
    req: Request<Body>,
) -> Response<Body> {
    proxy.request(req).await
}

/// Extracts the endpoint ID from the request: the `x-piko-endpoint` header
/// if present, otherwise the bottom-level label of a dotted Host (for
/// `xyz.piko.example.com` the endpoint is `xyz`). Returns an empty string
/// when neither names an endpoint.
fn endpoint_id_from_request(req: &Request<Body>) -> String {
    if let Some(value) = req.headers().get(ENDPOINT_HEADER) {
        if let Ok(endpoint_id) = value.to_str() {
            if !endpoint_id.is_empty() {
                return endpoint_id.to_string();
            }
        }
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();
    if host.contains('.') {
        host.split('.').next().unwrap_or_default().to_string()
    } else {
        String::new()
    }
}
