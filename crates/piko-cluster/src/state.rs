//! The local node's view of the cluster.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;
use tracing::warn;

use crate::metrics::ClusterMetrics;
use crate::node::{Node, NodeStatus};

type EndpointSubscriber = Box<dyn Fn(&str, usize) + Send + Sync>;

/// The known state of the cluster as seen by the local node.
///
/// The state is eventually consistent: the local node's record is
/// authoritative, remote records lag behind whatever gossip has delivered.
/// All reads return independent copies, so callers may hold onto them
/// without blocking mutations; the copy may already be stale by the time it
/// is inspected.
pub struct State {
    local_id: String,
    inner: RwLock<StateInner>,
    metrics: ClusterMetrics,
}

struct StateInner {
    nodes: HashMap<String, Node>,
    local_endpoint_subscribers: Vec<EndpointSubscriber>,
}

impl State {
    /// Creates the state seeded with the local node. The local node is
    /// always active and is never removed.
    pub fn new(mut local_node: Node) -> State {
        local_node.status = NodeStatus::Active;
        let local_id = local_node.id.clone();
        let metrics = ClusterMetrics::new();
        metrics.add_node(local_node.status);

        let mut nodes = HashMap::new();
        nodes.insert(local_id.clone(), local_node);
        State {
            local_id,
            inner: RwLock::new(StateInner {
                nodes,
                local_endpoint_subscribers: Vec::new(),
            }),
            metrics,
        }
    }

    /// ID of the local node. Immutable, so no lock is needed.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Returns a copy of the node with the given ID.
    pub fn node(&self, id: &str) -> Option<Node> {
        let inner = self.inner.read().unwrap();
        inner.nodes.get(id).cloned()
    }

    /// Returns a copy of the local node.
    pub fn local_node(&self) -> Node {
        let inner = self.inner.read().unwrap();
        inner
            .nodes
            .get(&self.local_id)
            .cloned()
            .expect("local node not in cluster state")
    }

    /// Returns a snapshot of all known nodes.
    pub fn nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        inner.nodes.values().cloned().collect()
    }

    /// Returns a copy of a remote node with at least one listener for the
    /// endpoint. The local node is never returned, even if it also serves
    /// the endpoint. When multiple peers qualify one is chosen uniformly at
    /// random, spreading forwarded load across the cluster.
    pub fn lookup_endpoint(&self, endpoint_id: &str) -> Option<Node> {
        let inner = self.inner.read().unwrap();
        let candidates: Vec<&Node> = inner
            .nodes
            .values()
            .filter(|node| {
                node.id != self.local_id
                    && node.endpoints.get(endpoint_id).copied().unwrap_or(0) > 0
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    /// Increments the local listener count for the endpoint and notifies
    /// subscribers with the new count.
    pub fn add_local_endpoint(&self, endpoint_id: &str) {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;
        let node = inner
            .nodes
            .get_mut(&self.local_id)
            .expect("local node not in cluster state");

        let count = node
            .endpoints
            .entry(endpoint_id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;

        for subscriber in &inner.local_endpoint_subscribers {
            subscriber(endpoint_id, count);
        }
    }

    /// Decrements the local listener count for the endpoint, removing the
    /// entry when it reaches zero, and notifies subscribers. Calling this
    /// for an endpoint with no listeners logs a warning and never takes the
    /// count below zero.
    pub fn remove_local_endpoint(&self, endpoint_id: &str) {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;
        let node = inner
            .nodes
            .get_mut(&self.local_id)
            .expect("local node not in cluster state");

        let count = match node.endpoints.get(endpoint_id).copied() {
            None | Some(0) => {
                warn!(endpoint_id, "remove local endpoint: endpoint not found");
                return;
            }
            Some(1) => {
                node.endpoints.remove(endpoint_id);
                0
            }
            Some(n) => {
                node.endpoints.insert(endpoint_id.to_string(), n - 1);
                n - 1
            }
        };

        for subscriber in &inner.local_endpoint_subscribers {
            subscriber(endpoint_id, count);
        }
    }

    /// Subscribes to local endpoint listener-count changes.
    ///
    /// The callback runs synchronously while the state lock is held, so it
    /// must not block and must not call back into the state.
    pub fn on_local_endpoint_update(&self, f: impl Fn(&str, usize) + Send + Sync + 'static) {
        let mut inner = self.inner.write().unwrap();
        inner.local_endpoint_subscribers.push(Box::new(f));
    }

    /// Adds a remote node, overwriting (with a warning) any existing record
    /// with the same ID. Attempts to add the local node are rejected.
    pub fn add_node(&self, node: Node) {
        let mut inner = self.inner.write().unwrap();
        if node.id == self.local_id {
            warn!(node_id = %node.id, "add node: cannot add local node");
            return;
        }

        let new_status = node.status;
        match inner.nodes.insert(node.id.clone(), node) {
            Some(previous) => {
                warn!(node_id = %previous.id, "add node: node already in cluster");
                self.metrics.transition_node(previous.status, new_status);
            }
            None => self.metrics.add_node(new_status),
        }
    }

    /// Removes a remote node. Returns false for unknown IDs and for the
    /// local node, which can never be removed.
    pub fn remove_node(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if id == self.local_id {
            warn!(node_id = id, "remove node: cannot remove local node");
            return false;
        }
        match inner.nodes.remove(id) {
            Some(node) => {
                self.metrics.remove_node(node.status);
                true
            }
            None => {
                warn!(node_id = id, "remove node: node not in cluster");
                false
            }
        }
    }

    /// Sets the status of a remote node.
    pub fn update_remote_status(&self, id: &str, status: NodeStatus) -> bool {
        let mut inner = self.inner.write().unwrap();
        if id == self.local_id {
            warn!(node_id = id, "update remote status: cannot update local node");
            return false;
        }
        match inner.nodes.get_mut(id) {
            Some(node) => {
                let old_status = node.status;
                node.status = status;
                self.metrics.transition_node(old_status, status);
                true
            }
            None => {
                warn!(node_id = id, "update remote status: node not in cluster");
                false
            }
        }
    }

    /// Sets the absolute listener count for an endpoint on a remote node.
    /// A count of zero removes the endpoint.
    pub fn update_remote_endpoint(&self, id: &str, endpoint_id: &str, listeners: usize) -> bool {
        let mut inner = self.inner.write().unwrap();
        if id == self.local_id {
            warn!(node_id = id, "update remote endpoint: cannot update local node");
            return false;
        }
        match inner.nodes.get_mut(id) {
            Some(node) => {
                if listeners == 0 {
                    node.endpoints.remove(endpoint_id);
                } else {
                    node.endpoints.insert(endpoint_id.to_string(), listeners);
                }
                true
            }
            None => {
                warn!(node_id = id, "update remote endpoint: node not in cluster");
                false
            }
        }
    }

    /// Removes an endpoint from a remote node.
    pub fn remove_remote_endpoint(&self, id: &str, endpoint_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if id == self.local_id {
            warn!(node_id = id, "remove remote endpoint: cannot update local node");
            return false;
        }
        match inner.nodes.get_mut(id) {
            Some(node) => {
                node.endpoints.remove(endpoint_id);
                true
            }
            None => {
                warn!(node_id = id, "remove remote endpoint: node not in cluster");
                false
            }
        }
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    fn local_node() -> Node {
        Node::new("local", "10.0.0.1:8000", "10.0.0.1:8002")
    }

    fn remote_node(id: &str) -> Node {
        Node::new(id, format!("{id}:8000"), format!("{id}:8002"))
    }

    #[test]
    fn test_local_node_always_active() {
        let mut node = local_node();
        node.status = NodeStatus::Left;
        let state = State::new(node);

        assert_eq!(state.local_node().status, NodeStatus::Active);
        assert_eq!(state.local_id(), "local");
    }

    #[test]
    fn test_reads_return_copies() {
        let state = State::new(local_node());

        let mut copy = state.local_node();
        copy.endpoints.insert("tampered".to_string(), 9);

        assert!(state.local_node().endpoints.is_empty());
    }

    #[test]
    fn test_add_remove_local_endpoint_counts() {
        let state = State::new(local_node());

        state.add_local_endpoint("e1");
        state.add_local_endpoint("e1");
        state.add_local_endpoint("e2");
        let endpoints = state.local_node().endpoints;
        assert_eq!(endpoints.get("e1"), Some(&2));
        assert_eq!(endpoints.get("e2"), Some(&1));

        state.remove_local_endpoint("e1");
        assert_eq!(state.local_node().endpoints.get("e1"), Some(&1));

        // Removing the last listener deletes the key entirely.
        state.remove_local_endpoint("e1");
        assert!(!state.local_node().endpoints.contains_key("e1"));
    }

    #[test]
    fn test_add_then_remove_is_identity() {
        let state = State::new(local_node());
        let before = state.local_node();

        state.add_local_endpoint("e");
        state.remove_local_endpoint("e");

        assert_eq!(state.local_node(), before);
    }

    #[test]
    fn test_remove_local_endpoint_absent_is_noop() {
        let state = State::new(local_node());

        state.remove_local_endpoint("missing");
        assert!(state.local_node().endpoints.is_empty());
    }

    #[test]
    fn test_local_endpoint_subscribers() {
        let state = State::new(local_node());
        let updates: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = updates.clone();
        state.on_local_endpoint_update(move |endpoint_id, listeners| {
            recorded
                .lock()
                .unwrap()
                .push((endpoint_id.to_string(), listeners));
        });

        state.add_local_endpoint("e");
        state.add_local_endpoint("e");
        state.remove_local_endpoint("e");
        state.remove_local_endpoint("e");
        // No notification for an absent endpoint.
        state.remove_local_endpoint("e");

        assert_eq!(
            *updates.lock().unwrap(),
            vec![
                ("e".to_string(), 1),
                ("e".to_string(), 2),
                ("e".to_string(), 1),
                ("e".to_string(), 0),
            ],
        );
    }

    #[test]
    fn test_lookup_endpoint_excludes_local() {
        let state = State::new(local_node());
        state.add_local_endpoint("e");

        assert!(state.lookup_endpoint("e").is_none());
    }

    #[test]
    fn test_lookup_endpoint_ignores_zero_count() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));
        state.update_remote_endpoint("n1", "e", 1);
        state.update_remote_endpoint("n1", "e", 0);

        assert!(state.lookup_endpoint("e").is_none());
    }

    #[test]
    fn test_lookup_endpoint_distributes_across_peers() {
        let state = State::new(local_node());
        for id in ["n1", "n2", "n3"] {
            state.add_node(remote_node(id));
            state.update_remote_endpoint(id, "e", 1);
        }

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(state.lookup_endpoint("e").unwrap().id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_add_node_rejects_local_id() {
        let state = State::new(local_node());
        let mut node = remote_node("local");
        node.proxy_addr = "imposter:8000".to_string();

        state.add_node(node);
        assert_eq!(state.local_node().proxy_addr, "10.0.0.1:8000");
    }

    #[test]
    fn test_add_node_overwrites_existing() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));

        let mut replacement = remote_node("n1");
        replacement.proxy_addr = "replaced:8000".to_string();
        state.add_node(replacement);

        assert_eq!(state.node("n1").unwrap().proxy_addr, "replaced:8000");
        assert_eq!(state.nodes().len(), 2);
    }

    #[test]
    fn test_add_then_remove_node_is_identity() {
        let state = State::new(local_node());
        let before: HashSet<String> = state.nodes().into_iter().map(|n| n.id).collect();

        state.add_node(remote_node("n1"));
        assert!(state.remove_node("n1"));

        let after: HashSet<String> = state.nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_node_guards() {
        let state = State::new(local_node());

        assert!(!state.remove_node("local"));
        assert!(!state.remove_node("unknown"));
    }

    #[test]
    fn test_update_remote_status() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));

        assert!(state.update_remote_status("n1", NodeStatus::Unreachable));
        assert_eq!(state.node("n1").unwrap().status, NodeStatus::Unreachable);

        assert!(!state.update_remote_status("unknown", NodeStatus::Left));
        assert!(!state.update_remote_status("local", NodeStatus::Left));
        assert_eq!(state.local_node().status, NodeStatus::Active);
    }

    #[test]
    fn test_update_remote_endpoint_normalises_zero() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));

        assert!(state.update_remote_endpoint("n1", "e", 3));
        assert_eq!(state.node("n1").unwrap().endpoints.get("e"), Some(&3));

        assert!(state.update_remote_endpoint("n1", "e", 0));
        assert!(!state.node("n1").unwrap().endpoints.contains_key("e"));
    }

    #[test]
    fn test_remove_remote_endpoint() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));
        state.update_remote_endpoint("n1", "e", 1);

        assert!(state.remove_remote_endpoint("n1", "e"));
        assert!(!state.node("n1").unwrap().endpoints.contains_key("e"));

        assert!(!state.remove_remote_endpoint("unknown", "e"));
        assert!(!state.remove_remote_endpoint("local", "e"));
    }

    #[test]
    fn test_metrics_track_statuses() {
        let state = State::new(local_node());
        state.add_node(remote_node("n1"));
        state.update_remote_status("n1", NodeStatus::Unreachable);

        let snapshot = state.metrics().snapshot();
        assert_eq!(snapshot.nodes_active, 1);
        assert_eq!(snapshot.nodes_unreachable, 1);

        state.remove_node("n1");
        assert_eq!(state.metrics().snapshot().nodes_unreachable, 0);
    }
}
