//! Cluster node records.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Status of a cluster node as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is healthy and reachable.
    Active,
    /// Node could not be reached; it may still come back.
    Unreachable,
    /// Node has left the cluster.
    Left,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Left => "left",
        }
    }

    /// Parses the string form produced by [`NodeStatus::as_str`].
    pub fn parse(s: &str) -> Option<NodeStatus> {
        match s {
            "active" => Some(NodeStatus::Active),
            "unreachable" => Some(NodeStatus::Unreachable),
            "left" => Some(NodeStatus::Left),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the cluster.
///
/// The endpoint table maps endpoint ID to the number of live upstream
/// listeners on that node. A count of zero is equivalent to absence and is
/// normalised away on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, immutable node ID.
    pub id: String,
    pub status: NodeStatus,
    /// Address peers use to forward proxied requests to this node.
    pub proxy_addr: String,
    /// Address of this node's admin API.
    pub admin_addr: String,
    #[serde(default)]
    pub endpoints: HashMap<String, usize>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        proxy_addr: impl Into<String>,
        admin_addr: impl Into<String>,
    ) -> Node {
        Node {
            id: id.into(),
            status: NodeStatus::Active,
            proxy_addr: proxy_addr.into(),
            admin_addr: admin_addr.into(),
            endpoints: HashMap::new(),
        }
    }
}

/// Generates a random node ID with a `piko-` prefix for debuggability.
pub fn generate_node_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(7)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("piko-{suffix}")
}
