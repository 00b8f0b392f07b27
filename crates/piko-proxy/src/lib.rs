//! Piko request routing.
//!
//! Upstream agents connect to the upstream listener and register endpoints;
//! inbound HTTP requests are dispatched either to a local upstream
//! connection or forwarded (at most once) to the cluster peer that holds
//! one.

pub mod error;
pub mod http;
pub mod local;
pub mod metrics;
pub mod proxy;
pub mod remote;
pub mod upstream;
pub mod ws;

pub use error::{ProxyError, Result};
pub use http::{ProxiedRequest, ProxiedResponse};
pub use local::{LocalProxy, RpcConn, UpstreamConn};
pub use metrics::{ProxyMetrics, ProxyMetricsSnapshot};
pub use proxy::{Proxy, ENDPOINT_HEADER, FORWARD_HEADER};
pub use remote::RemoteProxy;
