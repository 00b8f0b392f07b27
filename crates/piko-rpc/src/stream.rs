//! Multiplexed RPC streams.
//!
//! A [`Stream`] owns one message-oriented connection and multiplexes
//! concurrent request/response RPCs over it. One reader task decodes and
//! routes incoming messages; one writer task serializes all outbound writes
//! through a bounded channel so frames are never interleaved. Incoming
//! requests are handled in their own task to keep the read loop moving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::{Result, RpcError};
use crate::handler::Handler;
use crate::protocol::{Message, RpcType};

/// Capacity of the outbound write channel. Writers block (asynchronously)
/// once this many messages are queued.
const WRITE_CHANNEL_CAPACITY: usize = 64;

/// A bi-directional RPC stream between two peers. Either peer can send an
/// RPC request to the other.
///
/// All methods take `&self`; the stream is shared freely behind an `Arc`.
pub struct Stream {
    shared: Arc<Shared>,
}

struct Shared {
    conn: Arc<dyn Conn>,
    addr: String,
    handler: Handler,

    /// ID of the next outbound request.
    next_id: AtomicU64,

    write_tx: mpsc::Sender<Message>,

    /// Response slots for in-flight requests, keyed by message ID.
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,

    /// Cancelled when the stream shuts down; every pending RPC observes it.
    shutdown: CancellationToken,
    /// Guards once-only teardown.
    closed: AtomicBool,
}

/// Removes the response slot when an RPC future completes or is dropped, so
/// a cancelled request never leaks its slot.
struct SlotGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().unwrap().remove(&self.id);
    }
}

impl Stream {
    /// Creates an RPC stream on top of the given message-oriented
    /// connection and starts its reader and writer tasks.
    pub fn new(conn: Arc<dyn Conn>, handler: Handler) -> Stream {
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            addr: conn.addr().to_string(),
            conn,
            handler,
            next_id: AtomicU64::new(1),
            write_tx,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        spawn_supervised(shared.clone(), "reader", run_reader(shared.clone()));
        spawn_supervised(
            shared.clone(),
            "writer",
            run_writer(shared.clone(), write_rx),
        );

        Stream { shared }
    }

    /// Address of the connected peer.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Sends the request to the peer and waits for the matching response.
    ///
    /// Cancellation-safe: dropping the returned future unregisters the
    /// response slot, and a late response is silently discarded. The write
    /// itself may still reach the peer.
    pub async fn rpc(&self, rpc_type: RpcType, req: Vec<u8>) -> Result<Vec<u8>> {
        let shared = &*self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(id, tx);
        let _slot = SlotGuard { shared, id };

        let msg = Message::request(rpc_type, id, req);
        tokio::select! {
            res = shared.write_tx.send(msg) => {
                if res.is_err() {
                    return Err(RpcError::StreamClosed);
                }
            }
            _ = shared.shutdown.cancelled() => return Err(RpcError::StreamClosed),
        }

        let resp = tokio::select! {
            resp = rx => resp.map_err(|_| RpcError::StreamClosed)?,
            _ = shared.shutdown.cancelled() => return Err(RpcError::StreamClosed),
        };

        if resp.header.flags.err_not_supported() {
            return Err(RpcError::NotSupported);
        }
        Ok(resp.payload)
    }

    /// Monitors stream health by sending a heartbeat every `interval`, each
    /// bounded by `timeout`. Returns on the first failed heartbeat or when
    /// the stream shuts down; the caller treats either as connection death.
    pub async fn monitor(&self, interval: Duration, timeout: Duration) -> Result<()> {
        loop {
            self.heartbeat(timeout).await?;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shared.shutdown.cancelled() => return Err(RpcError::StreamClosed),
            }
        }
    }

    /// Closes the stream. Idempotent; only the first call tears down the
    /// connection. All pending RPCs fail with [`RpcError::StreamClosed`].
    pub async fn close(&self) -> Result<()> {
        self.shared.shutdown(RpcError::StreamClosed).await
    }

    async fn heartbeat(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.rpc(RpcType::Heartbeat, Vec::new())).await {
            Ok(Ok(_)) => {
                debug!(addr = %self.shared.addr, rtt = ?start.elapsed(), "heartbeat ok");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::HeartbeatTimeout),
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }
}

impl Shared {
    /// Tears the stream down exactly once. The cause is logged; callers of
    /// in-flight RPCs observe the `StreamClosed` sentinel.
    async fn shutdown(&self, cause: RpcError) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(addr = %self.addr, error = %cause, "stream closed");
        self.shutdown.cancel();
        self.conn.close().await
    }
}

/// Runs a stream task, converting a panic into stream shutdown instead of
/// letting it take the process down.
fn spawn_supervised(
    shared: Arc<Shared>,
    name: &'static str,
    fut: impl std::future::Future<Output = ()> + Send + 'static,
) {
    tokio::spawn(async move {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            warn!(task = name, "stream task panicked");
            let _ = shared
                .shutdown(RpcError::Conn(format!("panic in {name} task")))
                .await;
        }
    });
}

async fn run_reader(shared: Arc<Shared>) {
    loop {
        let buf = tokio::select! {
            res = shared.conn.read_message() => match res {
                Ok(buf) => buf,
                Err(e) => {
                    let _ = shared.shutdown(e).await;
                    return;
                }
            },
            _ = shared.shutdown.cancelled() => return,
        };

        let msg = match Message::decode(&buf) {
            Ok(msg) => msg,
            Err(e) => {
                let _ = shared.shutdown(e).await;
                return;
            }
        };

        debug!(
            addr = %shared.addr,
            rpc_type = %msg.header.rpc_type,
            message_id = msg.header.id,
            response = msg.header.flags.response(),
            len = msg.payload.len(),
            "message received",
        );

        if msg.header.flags.response() {
            // No slot means the request was already cancelled; discard.
            let slot = shared.pending.lock().unwrap().remove(&msg.header.id);
            if let Some(tx) = slot {
                let _ = tx.send(msg);
            }
        } else {
            // One task per request so a slow handler never blocks the read
            // loop.
            let shared = shared.clone();
            tokio::spawn(async move {
                handle_request(shared, msg).await;
            });
        }
    }
}

async fn run_writer(shared: Arc<Shared>, mut write_rx: mpsc::Receiver<Message>) {
    loop {
        let msg = tokio::select! {
            msg = write_rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        };

        if let Err(e) = shared.conn.write_message(&msg.encode()).await {
            let _ = shared.shutdown(e).await;
            return;
        }

        debug!(
            addr = %shared.addr,
            rpc_type = %msg.header.rpc_type,
            message_id = msg.header.id,
            response = msg.header.flags.response(),
            len = msg.payload.len(),
            "message sent",
        );
    }
}

async fn handle_request(shared: Arc<Shared>, msg: Message) {
    let rpc_type = msg.header.rpc_type;
    let id = msg.header.id;

    let Some(handler) = shared.handler.find(rpc_type) else {
        warn!(addr = %shared.addr, %rpc_type, message_id = id, "rpc type not supported");
        let resp = Message::not_supported(rpc_type, id);
        tokio::select! {
            _ = shared.write_tx.send(resp) => {}
            _ = shared.shutdown.cancelled() => {}
        }
        return;
    };

    let payload = match AssertUnwindSafe(handler(msg.payload)).catch_unwind().await {
        Ok(payload) => payload,
        Err(_) => {
            warn!(addr = %shared.addr, %rpc_type, message_id = id, "handler panicked");
            let _ = shared
                .shutdown(RpcError::Conn("panic in request handler".to_string()))
                .await;
            return;
        }
    };

    let resp = Message::response(rpc_type, id, payload);
    tokio::select! {
        _ = shared.write_tx.send(resp) => {}
        _ = shared.shutdown.cancelled() => {}
    }
}
