//! HTTP delta-push gossip transport.
//!
//! The cluster state treats the membership transport as a black box behind
//! the [`GossipSink`] / [`Gossiper`] boundary. This transport broadcasts
//! local metadata deltas to every known peer's admin API as they happen,
//! pushes the full local node view on a fixed interval as anti-entropy, and
//! announces departure on shutdown. Failed pushes mark the peer
//! unreachable; the record is kept so a later success restores it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use piko_cluster::{GossipSink, Gossiper, Node, NodeStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single metadata delta from `origin`. `value: None` deletes the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub origin: String,
    pub key: String,
    pub value: Option<String>,
}

/// Announcement of a node's graceful departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub node_id: String,
}

/// Outbound delta queue. The sink is called while the cluster state lock is
/// held, so it only enqueues; the broadcaster task drains the queue.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(String, Option<String>)>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<(String, Option<String>)>) -> ChannelSink {
        ChannelSink { tx }
    }
}

impl GossipSink for ChannelSink {
    fn upsert(&self, key: &str, value: &str) {
        let _ = self.tx.send((key.to_string(), Some(value.to_string())));
    }

    fn delete(&self, key: &str) {
        let _ = self.tx.send((key.to_string(), None));
    }
}

/// Pushes local state to peers and applies their replies.
pub struct GossipBroadcaster {
    gossiper: Arc<Gossiper>,
    client: reqwest::Client,
    /// Admin addresses from configuration; dynamically discovered peers are
    /// pushed to as well.
    join: Vec<String>,
    sync_interval: Duration,
}

impl GossipBroadcaster {
    pub fn new(
        gossiper: Arc<Gossiper>,
        join: Vec<String>,
        sync_interval: Duration,
    ) -> GossipBroadcaster {
        GossipBroadcaster {
            gossiper,
            client: reqwest::Client::new(),
            join,
            sync_interval,
        }
    }

    /// Runs until shutdown: an initial full sync, then deltas as they
    /// arrive and periodic anti-entropy syncs. Broadcasts a leave on the
    /// way out.
    pub async fn run(
        self,
        mut deltas: mpsc::UnboundedReceiver<(String, Option<String>)>,
        shutdown: CancellationToken,
    ) {
        self.sync_all().await;

        let mut sync_interval = tokio::time::interval(self.sync_interval);
        // The immediate first tick duplicates the initial sync.
        sync_interval.tick().await;

        loop {
            tokio::select! {
                delta = deltas.recv() => {
                    let Some((key, value)) = delta else { return };
                    self.broadcast_delta(&key, value.as_deref()).await;
                }
                _ = sync_interval.tick() => {
                    self.sync_all().await;
                }
                _ = shutdown.cancelled() => {
                    self.broadcast_leave().await;
                    return;
                }
            }
        }
    }

    /// All peers to push to: configured join targets plus every known
    /// remote node that has not left.
    fn targets(&self) -> Vec<(String, Option<String>)> {
        let state = self.gossiper.state();
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for node in state.nodes() {
            if node.id == state.local_id() || node.status == NodeStatus::Left {
                continue;
            }
            if seen.insert(node.admin_addr.clone()) {
                targets.push((node.admin_addr, Some(node.id)));
            }
        }
        for addr in &self.join {
            if seen.insert(addr.clone()) {
                targets.push((addr.clone(), None));
            }
        }
        targets
    }

    async fn sync_all(&self) {
        let local = self.gossiper.state().local_node();
        for (addr, node_id) in self.targets() {
            let url = format!("http://{addr}/piko/v1/gossip/sync");
            let result = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(2))
                .json(&local)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => match resp.json::<Node>().await {
                    Ok(peer) => {
                        let peer_id = peer.id.clone();
                        self.gossiper.apply_sync(peer);
                        self.gossiper.apply_reachable(&peer_id);
                    }
                    Err(e) => warn!(addr, error = %e, "gossip sync: invalid peer response"),
                },
                Ok(resp) => {
                    warn!(addr, status = %resp.status(), "gossip sync: peer rejected sync");
                }
                Err(e) => {
                    debug!(addr, error = %e, "gossip sync: peer unreachable");
                    if let Some(id) = node_id {
                        self.gossiper.apply_unreachable(&id);
                    }
                }
            }
        }
    }

    async fn broadcast_delta(&self, key: &str, value: Option<&str>) {
        let delta = DeltaMessage {
            origin: self.gossiper.state().local_id().to_string(),
            key: key.to_string(),
            value: value.map(str::to_string),
        };
        for (addr, node_id) in self.targets() {
            let url = format!("http://{addr}/piko/v1/gossip/delta");
            let result = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(2))
                .json(&delta)
                .send()
                .await;
            match result {
                Ok(_) => {
                    if let Some(id) = node_id {
                        self.gossiper.apply_reachable(&id);
                    }
                }
                Err(e) => {
                    debug!(addr, error = %e, "gossip delta: peer unreachable");
                    if let Some(id) = node_id {
                        self.gossiper.apply_unreachable(&id);
                    }
                }
            }
        }
    }

    async fn broadcast_leave(&self) {
        let leave = LeaveMessage {
            node_id: self.gossiper.state().local_id().to_string(),
        };
        for (addr, _) in self.targets() {
            let url = format!("http://{addr}/piko/v1/gossip/leave");
            let result = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(1))
                .json(&leave)
                .send()
                .await;
            if let Err(e) = result {
                debug!(addr, error = %e, "gossip leave: peer unreachable");
            }
        }
    }
}
