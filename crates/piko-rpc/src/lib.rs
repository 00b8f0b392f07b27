//! Piko RPC subsystem: multiplexed request/response streams over a single
//! bi-directional, message-oriented connection.
//!
//! Either peer of a stream can issue RPCs to the other. Outbound requests
//! are assigned monotonically increasing message IDs and matched to their
//! responses through a pending table; incoming requests are dispatched to a
//! registered handler in their own task so a slow handler never blocks the
//! read loop.

pub mod conn;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod stream;

pub use conn::{ChannelConn, Conn, WebSocketClientConn};
pub use error::{Result, RpcError};
pub use handler::Handler;
pub use protocol::{Flags, Header, Message, RpcType, HEADER_SIZE};
pub use stream::Stream;
