//! Translation between cluster state and the membership transport.
//!
//! The transport itself (SWIM probing, delta dissemination) is pluggable;
//! this module only defines the boundary. Outbound, local endpoint changes
//! become key/value upserts and deletes on a [`GossipSink`]. Inbound, node
//! lifecycle events and deltas are applied to [`State`] through a
//! [`Gossiper`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::node::{Node, NodeStatus};
use crate::state::State;

/// Metadata key carrying a node's proxy address.
pub const KEY_PROXY_ADDR: &str = "proxy_addr";
/// Metadata key carrying a node's admin address.
pub const KEY_ADMIN_ADDR: &str = "admin_addr";
/// Metadata key carrying a node's status.
pub const KEY_STATUS: &str = "status";
/// Prefix of metadata keys carrying endpoint listener counts.
pub const ENDPOINT_KEY_PREFIX: &str = "endpoint:";

/// Formats the metadata key for an endpoint's listener count.
pub fn endpoint_key(endpoint_id: &str) -> String {
    format!("{ENDPOINT_KEY_PREFIX}{endpoint_id}")
}

/// Outbound side of the membership transport. Implementations broadcast
/// upserts and deletes of the local node's metadata to the rest of the
/// cluster.
///
/// Calls may be made while the cluster state lock is held, so
/// implementations must not block and must not call back into the state.
pub trait GossipSink: Send + Sync {
    fn upsert(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// Applies membership transport events to the cluster state and feeds local
/// changes back out through the sink.
///
/// Transport callbacks may arrive concurrently; every application funnels
/// through the state's own lock.
pub struct Gossiper {
    state: Arc<State>,
}

impl Gossiper {
    pub fn new(state: Arc<State>) -> Gossiper {
        Gossiper { state }
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Publishes the local node's current metadata to the sink and
    /// subscribes it to future endpoint updates, so every local listener
    /// change becomes an outbound delta.
    pub fn register_sink(&self, sink: Arc<dyn GossipSink>) {
        let local = self.state.local_node();
        sink.upsert(KEY_PROXY_ADDR, &local.proxy_addr);
        sink.upsert(KEY_ADMIN_ADDR, &local.admin_addr);
        sink.upsert(KEY_STATUS, local.status.as_str());
        for (endpoint_id, listeners) in &local.endpoints {
            sink.upsert(&endpoint_key(endpoint_id), &listeners.to_string());
        }

        self.state.on_local_endpoint_update(move |endpoint_id, listeners| {
            let key = endpoint_key(endpoint_id);
            if listeners > 0 {
                sink.upsert(&key, &listeners.to_string());
            } else {
                sink.delete(&key);
            }
        });
    }

    /// Handles a peer joining the cluster, or a full state exchange with a
    /// known peer. Unknown nodes are added; known nodes have their status
    /// and endpoint table reconciled towards the received view.
    pub fn apply_sync(&self, node: Node) {
        if node.id == self.state.local_id() {
            warn!(node_id = %node.id, "gossip sync: ignoring own node");
            return;
        }

        let Some(existing) = self.state.node(&node.id) else {
            debug!(node_id = %node.id, "gossip sync: node joined");
            self.state.add_node(node);
            return;
        };

        self.state.update_remote_status(&node.id, node.status);
        for (endpoint_id, listeners) in &node.endpoints {
            self.state
                .update_remote_endpoint(&node.id, endpoint_id, *listeners);
        }
        for endpoint_id in existing.endpoints.keys() {
            if !node.endpoints.contains_key(endpoint_id) {
                self.state.remove_remote_endpoint(&node.id, endpoint_id);
            }
        }
    }

    /// Applies a single metadata delta from a peer. `None` deletes the key.
    /// Returns false if the delta could not be applied.
    pub fn apply_delta(&self, node_id: &str, key: &str, value: Option<&str>) -> bool {
        if let Some(endpoint_id) = key.strip_prefix(ENDPOINT_KEY_PREFIX) {
            return match value {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(listeners) => {
                        self.state
                            .update_remote_endpoint(node_id, endpoint_id, listeners)
                    }
                    Err(_) => {
                        warn!(node_id, key, value = raw, "gossip delta: invalid listener count");
                        false
                    }
                },
                None => self.state.remove_remote_endpoint(node_id, endpoint_id),
            };
        }

        match key {
            KEY_STATUS => match value.and_then(NodeStatus::parse) {
                Some(status) => self.state.update_remote_status(node_id, status),
                None => {
                    warn!(node_id, ?value, "gossip delta: invalid status");
                    false
                }
            },
            // Addresses are immutable after join; carried only by syncs.
            KEY_PROXY_ADDR | KEY_ADMIN_ADDR => {
                debug!(node_id, key, "gossip delta: ignoring address update");
                true
            }
            _ => {
                warn!(node_id, key, "gossip delta: unknown key");
                false
            }
        }
    }

    /// Marks a peer unreachable after a failed exchange. The record is kept
    /// so a later successful exchange can restore it.
    pub fn apply_unreachable(&self, node_id: &str) -> bool {
        self.state
            .update_remote_status(node_id, NodeStatus::Unreachable)
    }

    /// Restores a previously unreachable peer to active.
    pub fn apply_reachable(&self, node_id: &str) -> bool {
        match self.state.node(node_id) {
            Some(node) if node.status == NodeStatus::Unreachable => {
                self.state.update_remote_status(node_id, NodeStatus::Active)
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Handles a peer's confirmed departure: the node is marked left and
    /// removed from the state.
    pub fn apply_leave(&self, node_id: &str) -> bool {
        if node_id == self.state.local_id() {
            warn!(node_id, "gossip leave: ignoring own node");
            return false;
        }
        self.state.update_remote_status(node_id, NodeStatus::Left);
        self.state.remove_node(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Option<String>)>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(String, Option<String>)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl GossipSink for RecordingSink {
        fn upsert(&self, key: &str, value: &str) {
            self.events
                .lock()
                .unwrap()
                .push((key.to_string(), Some(value.to_string())));
        }

        fn delete(&self, key: &str) {
            self.events.lock().unwrap().push((key.to_string(), None));
        }
    }

    fn new_state(id: &str) -> Arc<State> {
        Arc::new(State::new(Node::new(
            id,
            format!("{id}:8000"),
            format!("{id}:8002"),
        )))
    }

    #[test]
    fn test_register_sink_publishes_initial_metadata() {
        let state = new_state("local");
        state.add_local_endpoint("e");
        let gossiper = Gossiper::new(state);

        let sink = Arc::new(RecordingSink::default());
        gossiper.register_sink(sink.clone());

        let events = sink.events();
        assert!(events.contains(&("proxy_addr".to_string(), Some("local:8000".to_string()))));
        assert!(events.contains(&("admin_addr".to_string(), Some("local:8002".to_string()))));
        assert!(events.contains(&("status".to_string(), Some("active".to_string()))));
        assert!(events.contains(&("endpoint:e".to_string(), Some("1".to_string()))));
    }

    #[test]
    fn test_local_updates_flow_to_sink() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());
        let sink = Arc::new(RecordingSink::default());
        gossiper.register_sink(sink.clone());

        state.add_local_endpoint("e");
        state.add_local_endpoint("e");
        state.remove_local_endpoint("e");
        state.remove_local_endpoint("e");

        let events = sink.events();
        let endpoint_events: Vec<_> = events
            .into_iter()
            .filter(|(key, _)| key == "endpoint:e")
            .collect();
        assert_eq!(
            endpoint_events,
            vec![
                ("endpoint:e".to_string(), Some("1".to_string())),
                ("endpoint:e".to_string(), Some("2".to_string())),
                ("endpoint:e".to_string(), Some("1".to_string())),
                ("endpoint:e".to_string(), None),
            ],
        );
    }

    #[test]
    fn test_apply_sync_adds_unknown_node() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());

        let mut peer = Node::new("peer", "peer:8000", "peer:8002");
        peer.endpoints.insert("e".to_string(), 2);
        gossiper.apply_sync(peer);

        let node = state.node("peer").unwrap();
        assert_eq!(node.endpoints.get("e"), Some(&2));
    }

    #[test]
    fn test_apply_sync_reconciles_known_node() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());

        let mut peer = Node::new("peer", "peer:8000", "peer:8002");
        peer.endpoints.insert("old".to_string(), 1);
        gossiper.apply_sync(peer);

        let mut updated = Node::new("peer", "peer:8000", "peer:8002");
        updated.status = NodeStatus::Active;
        updated.endpoints.insert("new".to_string(), 3);
        gossiper.apply_sync(updated);

        let node = state.node("peer").unwrap();
        assert!(!node.endpoints.contains_key("old"));
        assert_eq!(node.endpoints.get("new"), Some(&3));
    }

    #[test]
    fn test_apply_sync_ignores_own_node() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());

        let mut own = Node::new("local", "elsewhere:8000", "elsewhere:8002");
        own.endpoints.insert("e".to_string(), 1);
        gossiper.apply_sync(own);

        assert_eq!(state.local_node().proxy_addr, "local:8000");
        assert!(state.local_node().endpoints.is_empty());
    }

    #[test]
    fn test_apply_delta_endpoints() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());
        gossiper.apply_sync(Node::new("peer", "peer:8000", "peer:8002"));

        assert!(gossiper.apply_delta("peer", "endpoint:e", Some("2")));
        assert_eq!(state.node("peer").unwrap().endpoints.get("e"), Some(&2));

        assert!(gossiper.apply_delta("peer", "endpoint:e", None));
        assert!(!state.node("peer").unwrap().endpoints.contains_key("e"));

        assert!(!gossiper.apply_delta("peer", "endpoint:e", Some("not-a-number")));
        assert!(!gossiper.apply_delta("unknown", "endpoint:e", Some("1")));
    }

    #[test]
    fn test_apply_delta_status() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());
        gossiper.apply_sync(Node::new("peer", "peer:8000", "peer:8002"));

        assert!(gossiper.apply_delta("peer", "status", Some("unreachable")));
        assert_eq!(state.node("peer").unwrap().status, NodeStatus::Unreachable);

        assert!(!gossiper.apply_delta("peer", "status", Some("bogus")));
    }

    #[test]
    fn test_reachability_transitions() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());
        gossiper.apply_sync(Node::new("peer", "peer:8000", "peer:8002"));

        assert!(gossiper.apply_unreachable("peer"));
        assert_eq!(state.node("peer").unwrap().status, NodeStatus::Unreachable);

        assert!(gossiper.apply_reachable("peer"));
        assert_eq!(state.node("peer").unwrap().status, NodeStatus::Active);

        assert!(!gossiper.apply_reachable("unknown"));
    }

    #[test]
    fn test_apply_leave_removes_node() {
        let state = new_state("local");
        let gossiper = Gossiper::new(state.clone());
        gossiper.apply_sync(Node::new("peer", "peer:8000", "peer:8002"));

        assert!(gossiper.apply_leave("peer"));
        assert!(state.node("peer").is_none());

        assert!(!gossiper.apply_leave("local"));
    }

    #[test]
    fn test_two_states_converge_via_deltas() {
        // Wire node A's sink directly into node B's gossiper, as a
        // transport would.
        let state_a = new_state("a");
        let state_b = new_state("b");
        let gossiper_a = Gossiper::new(state_a.clone());
        let gossiper_b = Gossiper::new(state_b.clone());

        gossiper_b.apply_sync(state_a.local_node());

        struct ForwardSink {
            origin: String,
            target: Arc<State>,
        }
        impl GossipSink for ForwardSink {
            fn upsert(&self, key: &str, value: &str) {
                Gossiper::new(self.target.clone()).apply_delta(&self.origin, key, Some(value));
            }
            fn delete(&self, key: &str) {
                Gossiper::new(self.target.clone()).apply_delta(&self.origin, key, None);
            }
        }
        gossiper_a.register_sink(Arc::new(ForwardSink {
            origin: "a".to_string(),
            target: state_b.clone(),
        }));

        state_a.add_local_endpoint("e");
        assert_eq!(state_b.node("a").unwrap().endpoints.get("e"), Some(&1));
        assert_eq!(state_b.lookup_endpoint("e").unwrap().id, "a");

        state_a.remove_local_endpoint("e");
        assert!(state_b.lookup_endpoint("e").is_none());
    }
}
