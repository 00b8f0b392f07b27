//! Server-side WebSocket connection adapter.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use piko_rpc::{Conn, RpcError};
use tokio::sync::Mutex;

/// An accepted upstream WebSocket wrapped as a message-oriented
/// connection. Binary WebSocket messages map one-to-one onto RPC messages.
pub struct WebSocketConn {
    addr: String,
    tx: Mutex<SplitSink<WebSocket, Message>>,
    rx: Mutex<SplitStream<WebSocket>>,
}

impl WebSocketConn {
    pub fn new(socket: WebSocket, addr: String) -> WebSocketConn {
        let (tx, rx) = socket.split();
        WebSocketConn {
            addr,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Conn for WebSocketConn {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn read_message(&self) -> piko_rpc::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.next().await {
                Some(Ok(Message::Binary(b))) => return Ok(b.to_vec()),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RpcError::Conn("connection closed".to_string()));
                }
                // Control frames are not RPC messages.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RpcError::Conn(format!("read: {e}"))),
            }
        }
    }

    async fn write_message(&self, buf: &[u8]) -> piko_rpc::Result<()> {
        self.tx
            .lock()
            .await
            .send(Message::Binary(buf.to_vec().into()))
            .await
            .map_err(|e| RpcError::Conn(format!("write: {e}")))
    }

    async fn close(&self) -> piko_rpc::Result<()> {
        self.tx
            .lock()
            .await
            .close()
            .await
            .map_err(|e| RpcError::Conn(format!("close: {e}")))
    }
}
