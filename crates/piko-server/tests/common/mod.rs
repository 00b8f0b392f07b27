//! Helpers for the end-to-end proxy tests: an in-process upstream HTTP
//! server and a WebSocket agent that registers an endpoint and serves
//! proxied requests by forwarding them to the upstream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use piko_proxy::{ProxiedRequest, ProxiedResponse, ProxyError};
use piko_rpc::{Handler, RpcType, Stream, WebSocketClientConn};
use piko_server::{Config, Server};
use tokio::net::TcpListener;

/// Config with ephemeral ports and a fast gossip cadence.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.proxy.bind_addr = "127.0.0.1:0".to_string();
    config.upstream.bind_addr = "127.0.0.1:0".to_string();
    config.admin.bind_addr = "127.0.0.1:0".to_string();
    config.gossip.sync_interval_ms = 100;
    config
}

/// An origin HTTP server the agent forwards proxied requests to.
pub struct TestUpstream {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl TestUpstream {
    pub async fn start(app: Router) -> TestUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestUpstream { addr, task }
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An agent connection serving one endpoint: dials the node's upstream
/// listener and answers proxied requests by forwarding them to the origin
/// server.
pub struct TestAgent {
    stream: Arc<Stream>,
}

impl TestAgent {
    pub async fn connect(
        upstream_addr: SocketAddr,
        endpoint_id: &str,
        forward_to: SocketAddr,
    ) -> TestAgent {
        let url = format!("ws://{upstream_addr}/piko/v1/upstream/{endpoint_id}");
        let conn = Arc::new(
            WebSocketClientConn::connect(&url)
                .await
                .expect("connect agent"),
        );

        let client = reqwest::Client::new();
        let mut handler = Handler::new();
        handler.register(RpcType::Heartbeat, |payload| async move { payload });
        handler.register(RpcType::HttpRequest, move |payload| {
            let client = client.clone();
            async move {
                let resp = match forward(&client, forward_to, &payload).await {
                    Ok(resp) => resp,
                    Err(e) => ProxiedResponse::new(502, e.to_string().into_bytes()),
                };
                resp.encode().expect("encode response")
            }
        });

        TestAgent {
            stream: Arc::new(Stream::new(conn, handler)),
        }
    }

    pub async fn close(&self) {
        let _ = self.stream.close().await;
    }
}

async fn forward(
    client: &reqwest::Client,
    target: SocketAddr,
    payload: &[u8],
) -> Result<ProxiedResponse, ProxyError> {
    let req = ProxiedRequest::decode(payload)?;
    let url = format!("http://{target}{}", req.uri);
    let method = axum::http::Method::from_bytes(req.method.as_bytes())
        .map_err(|e| ProxyError::Codec(e.to_string()))?;

    let resp = client
        .request(method, &url)
        .headers(req.header_map())
        .body(req.body)
        .send()
        .await
        .map_err(|e| ProxyError::Unreachable(e.to_string()))?;

    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp
        .bytes()
        .await
        .map_err(|e| ProxyError::Unreachable(e.to_string()))?;
    Ok(ProxiedResponse::from_parts(status, &headers, body.to_vec()))
}

/// Polls the admin API until the endpoint has the expected number of
/// connections, the way clients wait for registration before sending
/// traffic.
pub async fn wait_for_endpoint_conns(admin_addr: SocketAddr, endpoint_id: &str, conns: usize) {
    let client = reqwest::Client::new();
    let url = format!("http://{admin_addr}/piko/v1/status/proxy/endpoints");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(resp) = client.get(&url).send().await {
            if let Ok(endpoints) = resp.json::<HashMap<String, Vec<String>>>().await {
                if endpoints.get(endpoint_id).map(|c| c.len()).unwrap_or(0) == conns {
                    return;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "endpoint {endpoint_id} did not reach {conns} conns in time",
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until gossip has taught the node about a peer serving the
/// endpoint.
pub async fn wait_for_remote_endpoint(server: &Server, endpoint_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.state().lookup_endpoint(endpoint_id).is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no peer advertised endpoint {endpoint_id} in time",
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
