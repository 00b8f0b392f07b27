use thiserror::Error;

/// Errors raised while routing a request to an upstream endpoint.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No live upstream connection (locally) or advertising peer (remotely)
    /// for the endpoint. Internal sentinel; the dispatcher maps it to a
    /// synthetic response and it never reaches a client as-is.
    #[error("endpoint not found")]
    EndpointNotFound,

    /// The upstream did not respond within the gateway timeout.
    #[error("endpoint timeout")]
    Timeout,

    /// The upstream or peer could not be reached, or failed mid-request.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// A proxied request or response could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),
}

impl From<piko_rpc::RpcError> for ProxyError {
    fn from(err: piko_rpc::RpcError) -> ProxyError {
        ProxyError::Unreachable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
