//! Cluster state metrics.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::node::NodeStatus;

/// Snapshot of cluster metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterMetricsSnapshot {
    /// Number of known nodes with status active.
    pub nodes_active: i64,
    /// Number of known nodes with status unreachable.
    pub nodes_unreachable: i64,
    /// Number of known nodes with status left.
    pub nodes_left: i64,
}

/// Thread-safe node gauges, one per status.
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    nodes_active: AtomicI64,
    nodes_unreachable: AtomicI64,
    nodes_left: AtomicI64,
}

impl ClusterMetrics {
    pub fn new() -> ClusterMetrics {
        ClusterMetrics::default()
    }

    pub fn add_node(&self, status: NodeStatus) {
        self.gauge(status).fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_node(&self, status: NodeStatus) {
        self.gauge(status).fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transition_node(&self, from: NodeStatus, to: NodeStatus) {
        self.remove_node(from);
        self.add_node(to);
    }

    pub fn snapshot(&self) -> ClusterMetricsSnapshot {
        ClusterMetricsSnapshot {
            nodes_active: self.nodes_active.load(Ordering::Relaxed),
            nodes_unreachable: self.nodes_unreachable.load(Ordering::Relaxed),
            nodes_left: self.nodes_left.load(Ordering::Relaxed),
        }
    }

    fn gauge(&self, status: NodeStatus) -> &AtomicI64 {
        match status {
            NodeStatus::Active => &self.nodes_active,
            NodeStatus::Unreachable => &self.nodes_unreachable,
            NodeStatus::Left => &self.nodes_left,
        }
    }
}
