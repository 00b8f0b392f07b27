//! Local upstream connections and the endpoint connection table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use piko_cluster::State;
use piko_rpc::{RpcType, Stream};
use tracing::info;

use crate::error::{ProxyError, Result};
use crate::http::{ProxiedRequest, ProxiedResponse};
use crate::metrics::ProxyMetrics;

/// A live connection to an upstream listener serving one endpoint.
///
/// Identity is the `(endpoint_id, addr)` pair; duplicates are allowed since
/// several agents may serve the same endpoint.
#[async_trait]
pub trait UpstreamConn: Send + Sync {
    fn endpoint_id(&self) -> &str;
    fn addr(&self) -> &str;
    async fn request(&self, req: ProxiedRequest) -> Result<ProxiedResponse>;
}

/// Upstream connection backed by an RPC stream: requests travel down the
/// stream as `HttpRequest` RPCs.
pub struct RpcConn {
    endpoint_id: String,
    stream: Arc<Stream>,
}

impl RpcConn {
    pub fn new(endpoint_id: impl Into<String>, stream: Arc<Stream>) -> RpcConn {
        RpcConn {
            endpoint_id: endpoint_id.into(),
            stream,
        }
    }
}

#[async_trait]
impl UpstreamConn for RpcConn {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn addr(&self) -> &str {
        self.stream.addr()
    }

    async fn request(&self, req: ProxiedRequest) -> Result<ProxiedResponse> {
        let payload = req.encode()?;
        let resp = self.stream.rpc(RpcType::HttpRequest, payload).await?;
        ProxiedResponse::decode(&resp)
    }
}

struct EndpointConns {
    conns: Vec<Arc<dyn UpstreamConn>>,
    /// Round-robin cursor. Wraps modulo the connection count on use.
    next: AtomicUsize,
}

/// The endpoint → upstream-connection table for this node.
///
/// Adding and removing connections keeps the cluster state's local endpoint
/// listener counts in step, which is what peers learn through gossip.
pub struct LocalProxy {
    cluster: Arc<State>,
    endpoints: Mutex<HashMap<String, EndpointConns>>,
    metrics: Arc<ProxyMetrics>,
}

impl LocalProxy {
    pub fn new(cluster: Arc<State>, metrics: Arc<ProxyMetrics>) -> LocalProxy {
        LocalProxy {
            cluster,
            endpoints: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Registers a connection for its endpoint.
    pub fn add_conn(&self, conn: Arc<dyn UpstreamConn>) {
        let endpoint_id = conn.endpoint_id().to_string();
        info!(endpoint_id, addr = conn.addr(), "add upstream conn");
        {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints
                .entry(endpoint_id.clone())
                .or_insert_with(|| EndpointConns {
                    conns: Vec::new(),
                    next: AtomicUsize::new(0),
                })
                .conns
                .push(conn);
        }
        self.metrics.upstream_connected();
        self.cluster.add_local_endpoint(&endpoint_id);
    }

    /// Removes one connection with the given identity, if present.
    pub fn remove_conn(&self, endpoint_id: &str, addr: &str) {
        info!(endpoint_id, addr, "remove upstream conn");
        let removed = {
            let mut endpoints = self.endpoints.lock().unwrap();
            let Some(entry) = endpoints.get_mut(endpoint_id) else {
                return;
            };
            let Some(idx) = entry.conns.iter().position(|c| c.addr() == addr) else {
                return;
            };
            entry.conns.remove(idx);
            if entry.conns.is_empty() {
                endpoints.remove(endpoint_id);
            }
            true
        };
        if removed {
            self.metrics.upstream_disconnected();
            self.cluster.remove_local_endpoint(endpoint_id);
        }
    }

    /// Dispatches the request to the next connection for the endpoint,
    /// round-robin.
    pub async fn request(
        &self,
        endpoint_id: &str,
        req: ProxiedRequest,
    ) -> Result<ProxiedResponse> {
        let conn = {
            let endpoints = self.endpoints.lock().unwrap();
            let entry = endpoints
                .get(endpoint_id)
                .ok_or(ProxyError::EndpointNotFound)?;
            let idx = entry.next.fetch_add(1, Ordering::Relaxed) % entry.conns.len();
            entry.conns[idx].clone()
        };
        self.metrics.inc_local_requests();
        conn.request(req).await
    }

    /// Returns endpoint ID → connection addresses for all connected
    /// upstream listeners.
    pub fn conn_addrs(&self) -> HashMap<String, Vec<String>> {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .iter()
            .map(|(endpoint_id, entry)| {
                (
                    endpoint_id.clone(),
                    entry.conns.iter().map(|c| c.addr().to_string()).collect(),
                )
            })
            .collect()
    }
}
