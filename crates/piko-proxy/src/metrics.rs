//! Proxy request metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of proxy metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyMetricsSnapshot {
    /// Requests dispatched to a local upstream connection.
    pub local_requests_total: u64,
    /// Requests forwarded to a cluster peer.
    pub remote_requests_total: u64,
    /// Inbound requests that already carried the forward marker.
    pub forwarded_requests_total: u64,
    /// Requests answered with a synthetic error response.
    pub errors_total: u64,
    /// Currently connected upstream listeners.
    pub connected_upstreams: i64,
}

/// Thread-safe proxy metrics collector.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    local_requests_total: AtomicU64,
    remote_requests_total: AtomicU64,
    forwarded_requests_total: AtomicU64,
    errors_total: AtomicU64,
    connected_upstreams: AtomicI64,
}

impl ProxyMetrics {
    pub fn new() -> ProxyMetrics {
        ProxyMetrics::default()
    }

    pub fn inc_local_requests(&self) {
        self.local_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remote_requests(&self) {
        self.remote_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded_requests(&self) {
        self.forwarded_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_connected(&self) {
        self.connected_upstreams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_disconnected(&self) {
        self.connected_upstreams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyMetricsSnapshot {
        ProxyMetricsSnapshot {
            local_requests_total: self.local_requests_total.load(Ordering::Relaxed),
            remote_requests_total: self.remote_requests_total.load(Ordering::Relaxed),
            forwarded_requests_total: self.forwarded_requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            connected_upstreams: self.connected_upstreams.load(Ordering::Relaxed),
        }
    }
}
