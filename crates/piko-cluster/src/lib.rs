//! Cluster membership state for Piko nodes.
//!
//! Each node keeps a local, eventually-consistent view of its peers and the
//! endpoints they advertise. The local node's endpoint table is
//! authoritative; remote tables are a lagging reflection maintained from
//! gossip. [`Gossiper`] translates between the state and whatever membership
//! transport carries the updates.

pub mod gossip;
pub mod metrics;
pub mod node;
pub mod state;

pub use gossip::{GossipSink, Gossiper};
pub use metrics::{ClusterMetrics, ClusterMetricsSnapshot};
pub use node::{generate_node_id, Node, NodeStatus};
pub use state::State;
