use thiserror::Error;

/// Errors surfaced by the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The stream has shut down. All pending and future RPCs on the stream
    /// fail with this sentinel regardless of the underlying cause, which is
    /// logged when the stream closes.
    #[error("stream closed")]
    StreamClosed,

    /// The peer has no handler registered for the request type.
    #[error("rpc type not supported")]
    NotSupported,

    /// A heartbeat did not complete within its per-beat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// The underlying connection failed or was closed by the peer.
    #[error("connection: {0}")]
    Conn(String),

    /// A received frame was too short to contain a header.
    #[error("short header: {0} bytes")]
    ShortHeader(usize),

    /// A received header carried an RPC type outside the known range.
    #[error("unknown rpc type: {0}")]
    UnknownRpcType(u16),
}

pub type Result<T> = std::result::Result<T, RpcError>;
