//! Server assembly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use piko_cluster::{generate_node_id, Gossiper, Node, State};
use piko_proxy::Proxy;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admin;
use crate::config::Config;
use crate::gossip::{ChannelSink, GossipBroadcaster};

/// A running Piko node: the proxy, upstream and admin listeners plus the
/// gossip broadcaster.
pub struct Server {
    state: Arc<State>,
    proxy_addr: SocketAddr,
    upstream_addr: SocketAddr,
    admin_addr: SocketAddr,
    shutdown: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    broadcaster: JoinHandle<()>,
}

impl Server {
    /// Binds all listeners and starts the node's tasks.
    pub async fn start(config: Config) -> anyhow::Result<Server> {
        let proxy_listener = TcpListener::bind(&config.proxy.bind_addr)
            .await
            .with_context(|| format!("bind proxy listener: {}", config.proxy.bind_addr))?;
        let upstream_listener = TcpListener::bind(&config.upstream.bind_addr)
            .await
            .with_context(|| format!("bind upstream listener: {}", config.upstream.bind_addr))?;
        let admin_listener = TcpListener::bind(&config.admin.bind_addr)
            .await
            .with_context(|| format!("bind admin listener: {}", config.admin.bind_addr))?;

        let proxy_addr = proxy_listener.local_addr()?;
        let upstream_addr = upstream_listener.local_addr()?;
        let admin_addr = admin_listener.local_addr()?;

        let node_id = config.node.id.clone().unwrap_or_else(generate_node_id);
        let advertise_proxy = config
            .proxy
            .advertise_addr
            .clone()
            .unwrap_or_else(|| proxy_addr.to_string());
        let advertise_admin = config
            .admin
            .advertise_addr
            .clone()
            .unwrap_or_else(|| admin_addr.to_string());

        let state = Arc::new(State::new(Node::new(
            node_id.clone(),
            advertise_proxy,
            advertise_admin,
        )));
        let proxy = Arc::new(Proxy::new(
            state.clone(),
            Duration::from_millis(config.proxy.gateway_timeout_ms),
        ));
        let gossiper = Arc::new(Gossiper::new(state.clone()));

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        gossiper.register_sink(Arc::new(ChannelSink::new(delta_tx)));

        let shutdown = CancellationToken::new();
        let mut listeners = Vec::new();

        listeners.push(spawn_listener(
            proxy_listener,
            piko_proxy::proxy::router(proxy.clone()),
            shutdown.clone(),
        ));
        listeners.push(spawn_listener(
            upstream_listener,
            piko_proxy::upstream::router(
                proxy.clone(),
                Duration::from_millis(config.upstream.heartbeat_interval_ms),
                Duration::from_millis(config.upstream.heartbeat_timeout_ms),
            ),
            shutdown.clone(),
        ));
        listeners.push(spawn_listener(
            admin_listener,
            admin::router(state.clone(), proxy.clone(), gossiper.clone()),
            shutdown.clone(),
        ));

        let broadcaster = GossipBroadcaster::new(
            gossiper,
            config.gossip.join.clone(),
            Duration::from_millis(config.gossip.sync_interval_ms),
        );
        let broadcaster = tokio::spawn(broadcaster.run(delta_rx, shutdown.clone()));

        info!(
            node_id,
            proxy = %proxy_addr,
            upstream = %upstream_addr,
            admin = %admin_addr,
            "piko server started",
        );

        Ok(Server {
            state,
            proxy_addr,
            upstream_addr,
            admin_addr,
            shutdown,
            listeners,
            broadcaster,
        })
    }

    /// Address of the proxy listener.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Address of the upstream listener.
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Address of the admin listener.
    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    /// The node's cluster state.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Gracefully stops the node. The gossip broadcaster announces the
    /// departure to peers before the process lets go.
    pub async fn shutdown(self) {
        info!(node_id = self.state.local_id(), "piko server stopping");
        self.shutdown.cancel();
        // The broadcaster finishes after announcing the departure.
        let _ = self.broadcaster.await;
        // Listeners may be pinned by long-lived upstream connections, so
        // they are torn down rather than drained.
        for listener in self.listeners {
            listener.abort();
            let _ = listener.await;
        }
    }
}

fn spawn_listener(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "listener failed");
        }
    })
}
