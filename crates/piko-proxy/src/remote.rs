//! Forwarding to cluster peers.

use std::sync::Arc;

use axum::http::Method;
use piko_cluster::State;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::http::{ProxiedRequest, ProxiedResponse};
use crate::metrics::ProxyMetrics;
use crate::proxy::{ENDPOINT_HEADER, FORWARD_HEADER};

/// Forwards requests to whichever peer advertises a listener for the
/// endpoint, as learned from cluster state.
pub struct RemoteProxy {
    state: Arc<State>,
    client: reqwest::Client,
    metrics: Arc<ProxyMetrics>,
}

impl RemoteProxy {
    pub fn new(state: Arc<State>, metrics: Arc<ProxyMetrics>) -> RemoteProxy {
        RemoteProxy {
            state,
            client: reqwest::Client::new(),
            metrics,
        }
    }

    /// Forwards the request to a peer advertising the endpoint. The forward
    /// marker is always overwritten, never trusted from the inbound
    /// request, so the receiving node will not forward a second hop. The
    /// endpoint header is set explicitly because the peer connection
    /// rewrites `Host`.
    pub async fn request(
        &self,
        endpoint_id: &str,
        mut req: ProxiedRequest,
    ) -> Result<ProxiedResponse> {
        let node = self
            .state
            .lookup_endpoint(endpoint_id)
            .ok_or(ProxyError::EndpointNotFound)?;

        req.set_header(FORWARD_HEADER, b"true");
        req.set_header(ENDPOINT_HEADER, endpoint_id.as_bytes());

        let url = format!("http://{}{}", node.proxy_addr, req.uri);
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| ProxyError::Codec(format!("method: {e}")))?;

        debug!(endpoint_id, node_id = %node.id, url, "forwarding to remote node");
        self.metrics.inc_remote_requests();

        let headers = req.header_map();
        let resp = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(req.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Timeout
                } else {
                    ProxyError::Unreachable(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProxyError::Unreachable(format!("read response: {e}")))?;
        Ok(ProxiedResponse::from_parts(status, &headers, body.to_vec()))
    }
}
