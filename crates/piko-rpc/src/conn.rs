//! Message-oriented connections.
//!
//! A [`Conn`] carries whole messages rather than a byte stream; each read
//! returns exactly one message as written by the peer. The RPC stream layers
//! its framing on top and drives the connection from one reader task and one
//! writer task, so implementations guard their halves with interior mutexes.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, RpcError};

/// A bi-directional, message-oriented connection.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Address of the peer, for logging and connection identity.
    fn addr(&self) -> &str;

    /// Reads the next whole message. Returns an error once the connection
    /// is closed.
    async fn read_message(&self) -> Result<Vec<u8>>;

    /// Writes a whole message.
    async fn write_message(&self, buf: &[u8]) -> Result<()>;

    /// Closes the connection. Reads and writes fail afterwards.
    async fn close(&self) -> Result<()>;
}

/// In-memory connection backed by a pair of channels. Used by tests to
/// exercise streams without a network.
pub struct ChannelConn {
    addr: String,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelConn {
    /// Creates a connected pair. Messages written to one side are read from
    /// the other.
    pub fn pipe() -> (ChannelConn, ChannelConn) {
        let (a_tx, a_rx) = mpsc::channel(32);
        let (b_tx, b_rx) = mpsc::channel(32);
        (
            ChannelConn {
                addr: "channel-a".to_string(),
                tx: Mutex::new(Some(a_tx)),
                rx: Mutex::new(b_rx),
            },
            ChannelConn {
                addr: "channel-b".to_string(),
                tx: Mutex::new(Some(b_tx)),
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Conn for ChannelConn {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn read_message(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RpcError::Conn("connection closed".to_string()))
    }

    async fn write_message(&self, buf: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        let tx = tx
            .as_ref()
            .ok_or_else(|| RpcError::Conn("connection closed".to_string()))?;
        tx.send(buf.to_vec())
            .await
            .map_err(|_| RpcError::Conn("connection closed".to_string()))
    }

    async fn close(&self) -> Result<()> {
        // Dropping the sender wakes the peer's pending read.
        *self.tx.lock().await = None;
        Ok(())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side WebSocket connection. Binary WebSocket messages map
/// one-to-one onto RPC messages.
pub struct WebSocketClientConn {
    addr: String,
    tx: Mutex<SplitSink<WsStream, WsMessage>>,
    rx: Mutex<SplitStream<WsStream>>,
}

impl WebSocketClientConn {
    /// Dials the given `ws://` URL.
    pub async fn connect(url: &str) -> Result<WebSocketClientConn> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RpcError::Conn(format!("connect: {e}")))?;
        let (tx, rx) = ws.split();
        Ok(WebSocketClientConn {
            addr: url.to_string(),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Conn for WebSocketClientConn {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn read_message(&self) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.next().await {
                Some(Ok(WsMessage::Binary(b))) => return Ok(b.to_vec()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(RpcError::Conn("connection closed".to_string()));
                }
                // Control frames are not RPC messages.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RpcError::Conn(format!("read: {e}"))),
            }
        }
    }

    async fn write_message(&self, buf: &[u8]) -> Result<()> {
        self.tx
            .lock()
            .await
            .send(WsMessage::Binary(buf.to_vec().into()))
            .await
            .map_err(|e| RpcError::Conn(format!("write: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.tx
            .lock()
            .await
            .close()
            .await
            .map_err(|e| RpcError::Conn(format!("close: {e}")))
    }
}
