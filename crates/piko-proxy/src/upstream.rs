//! The upstream listener agents dial into.
//!
//! An agent opens one WebSocket per endpoint it serves at
//! `/piko/v1/upstream/{endpoint_id}`. The socket becomes an RPC stream:
//! proxied requests flow down it, and the server heartbeats the agent to
//! detect death, removing the connection (and with it the advertised
//! endpoint) when the stream fails.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use piko_rpc::{Handler, RpcType, Stream};
use tracing::{debug, info};

use crate::local::RpcConn;
use crate::proxy::Proxy;
use crate::ws::WebSocketConn;

#[derive(Clone)]
struct UpstreamContext {
    proxy: Arc<Proxy>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

/// Builds the upstream listener router.
pub fn router(
    proxy: Arc<Proxy>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) -> Router {
    Router::new()
        .route("/piko/v1/upstream/{endpoint_id}", get(upstream_handler))
        .with_state(UpstreamContext {
            proxy,
            heartbeat_interval,
            heartbeat_timeout,
        })
}

async fn upstream_handler(
    Path(endpoint_id): Path<String>,
    State(ctx): State<UpstreamContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_upstream(socket, endpoint_id, addr, ctx))
}

async fn serve_upstream(
    socket: WebSocket,
    endpoint_id: String,
    addr: SocketAddr,
    ctx: UpstreamContext,
) {
    let conn = Arc::new(WebSocketConn::new(socket, addr.to_string()));

    let mut handler = Handler::new();
    handler.register(RpcType::Heartbeat, |payload| async move { payload });

    let stream = Arc::new(Stream::new(conn, handler));
    let rpc_conn = Arc::new(RpcConn::new(endpoint_id.clone(), stream.clone()));

    info!(endpoint_id, addr = %addr, "upstream listener connected");
    ctx.proxy.add_conn(rpc_conn);

    // Blocks until the first failed heartbeat or stream shutdown.
    let monitor = stream
        .monitor(ctx.heartbeat_interval, ctx.heartbeat_timeout)
        .await;
    debug!(endpoint_id, addr = %addr, error = ?monitor.err(), "upstream listener disconnected");

    ctx.proxy.remove_conn(&endpoint_id, stream.addr());
    let _ = stream.close().await;
}
