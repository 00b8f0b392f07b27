//! Admin API: read-only status endpoints and the inbound side of the
//! gossip transport.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use piko_cluster::{ClusterMetricsSnapshot, Gossiper, Node, State as ClusterState};
use piko_proxy::{Proxy, ProxyMetricsSnapshot};
use serde::Serialize;

use crate::gossip::{DeltaMessage, LeaveMessage};

#[derive(Clone)]
struct AdminContext {
    state: Arc<ClusterState>,
    proxy: Arc<Proxy>,
    gossiper: Arc<Gossiper>,
}

/// Combined metric snapshots for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub cluster: ClusterMetricsSnapshot,
    pub proxy: ProxyMetricsSnapshot,
}

/// Builds the admin router.
pub fn router(state: Arc<ClusterState>, proxy: Arc<Proxy>, gossiper: Arc<Gossiper>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/piko/v1/status/cluster/nodes", get(cluster_nodes_handler))
        .route(
            "/piko/v1/status/proxy/endpoints",
            get(proxy_endpoints_handler),
        )
        .route("/piko/v1/status/metrics", get(metrics_handler))
        .route("/piko/v1/gossip/sync", post(gossip_sync_handler))
        .route("/piko/v1/gossip/delta", post(gossip_delta_handler))
        .route("/piko/v1/gossip/leave", post(gossip_leave_handler))
        .with_state(AdminContext {
            state,
            proxy,
            gossiper,
        })
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn cluster_nodes_handler(State(ctx): State<AdminContext>) -> Json<Vec<Node>> {
    Json(ctx.state.nodes())
}

async fn proxy_endpoints_handler(
    State(ctx): State<AdminContext>,
) -> Json<HashMap<String, Vec<String>>> {
    Json(ctx.proxy.conn_addrs())
}

async fn metrics_handler(State(ctx): State<AdminContext>) -> Json<MetricsSummary> {
    Json(MetricsSummary {
        cluster: ctx.state.metrics().snapshot(),
        proxy: ctx.proxy.metrics(),
    })
}

/// Full state exchange: applies the sender's node view and replies with our
/// own, so a one-directional push still teaches both sides.
async fn gossip_sync_handler(
    State(ctx): State<AdminContext>,
    Json(node): Json<Node>,
) -> Json<Node> {
    ctx.gossiper.apply_sync(node);
    Json(ctx.state.local_node())
}

async fn gossip_delta_handler(
    State(ctx): State<AdminContext>,
    Json(delta): Json<DeltaMessage>,
) -> StatusCode {
    if ctx
        .gossiper
        .apply_delta(&delta.origin, &delta.key, delta.value.as_deref())
    {
        StatusCode::OK
    } else {
        // Unknown origin; the sender's next periodic sync will catch us up.
        StatusCode::NOT_FOUND
    }
}

async fn gossip_leave_handler(
    State(ctx): State<AdminContext>,
    Json(leave): Json<LeaveMessage>,
) -> StatusCode {
    if ctx.gossiper.apply_leave(&leave.node_id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
