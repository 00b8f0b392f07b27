//! Registry mapping RPC types to request handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::protocol::RpcType;

/// Boxed async handler. Takes the request payload and returns the response
/// payload.
pub type HandlerFn =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Vec<u8>> + Send>> + Send + Sync>;

/// Handler registry for incoming RPC requests.
///
/// The registry is built before the stream starts and is immutable
/// afterwards. Requests for types without a registered handler are rejected
/// with a "not supported" response.
#[derive(Default)]
pub struct Handler {
    handlers: HashMap<RpcType, HandlerFn>,
}

impl Handler {
    pub fn new() -> Handler {
        Handler {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for the given RPC type, replacing any previous
    /// registration.
    pub fn register<F, Fut>(&mut self, rpc_type: RpcType, f: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<u8>> + Send + 'static,
    {
        self.handlers
            .insert(rpc_type, Arc::new(move |payload| Box::pin(f(payload))));
    }

    /// Looks up the handler for the given RPC type.
    pub fn find(&self, rpc_type: RpcType) -> Option<HandlerFn> {
        self.handlers.get(&rpc_type).cloned()
    }
}
