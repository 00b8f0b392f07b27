//! Wire protocol for RPC messages.
//!
//! Every message is a fixed 14-byte big-endian header followed by an opaque
//! payload. The transport is message-oriented, so the payload length is
//! implied by the message boundary rather than carried in the header.

use crate::error::{Result, RpcError};

/// Size of the encoded message header in bytes
/// (type:2 + id:8 + flags:2 + reserved:2).
pub const HEADER_SIZE: usize = 14;

/// Supported RPC types. The wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RpcType {
    /// Liveness probe. The receiver echoes the payload.
    Heartbeat = 1,
    /// Proxied HTTP request. The payload is a serialized HTTP request and
    /// the response payload a serialized HTTP response.
    HttpRequest = 2,
}

impl RpcType {
    /// Decodes a wire value, or `None` if the value is unknown.
    pub fn from_u16(v: u16) -> Option<RpcType> {
        match v {
            1 => Some(RpcType::Heartbeat),
            2 => Some(RpcType::HttpRequest),
            _ => None,
        }
    }

    /// Returns the stable wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for RpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcType::Heartbeat => write!(f, "heartbeat"),
            RpcType::HttpRequest => write!(f, "http-request"),
        }
    }
}

const FLAG_RESPONSE: u16 = 1 << 0;
const FLAG_ERR_NOT_SUPPORTED: u16 = 1 << 1;

/// Message flag word. Bit 0 marks a response, bit 1 a "not supported"
/// error response; the remaining bits are reserved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    /// Returns whether the message is a response.
    pub fn response(self) -> bool {
        self.0 & FLAG_RESPONSE != 0
    }

    /// Marks the message as a response.
    pub fn set_response(&mut self) {
        self.0 |= FLAG_RESPONSE;
    }

    /// Returns whether the peer rejected the request type.
    pub fn err_not_supported(self) -> bool {
        self.0 & FLAG_ERR_NOT_SUPPORTED != 0
    }

    /// Marks the response as a "not supported" error.
    pub fn set_err_not_supported(&mut self) {
        self.0 |= FLAG_ERR_NOT_SUPPORTED;
    }

    /// Returns the raw flag word.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Builds flags from a raw wire value.
    pub fn from_u16(v: u16) -> Flags {
        Flags(v)
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// RPC type of the request this message belongs to.
    pub rpc_type: RpcType,
    /// Message ID. A response carries the ID of its request.
    pub id: u64,
    /// Flag word.
    pub flags: Flags,
}

impl Header {
    /// Encodes the header into its 14-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.rpc_type.as_u16().to_be_bytes());
        buf[2..10].copy_from_slice(&self.id.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.as_u16().to_be_bytes());
        // buf[12..14] reserved, zero.
        buf
    }

    /// Decodes a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(RpcError::ShortHeader(buf.len()));
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        let rpc_type = RpcType::from_u16(raw_type).ok_or(RpcError::UnknownRpcType(raw_type))?;
        let id = u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        let flags = Flags::from_u16(u16::from_be_bytes([buf[10], buf[11]]));
        Ok(Header {
            rpc_type,
            id,
            flags,
        })
    }
}

/// A full RPC message: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a request message.
    pub fn request(rpc_type: RpcType, id: u64, payload: Vec<u8>) -> Message {
        Message {
            header: Header {
                rpc_type,
                id,
                flags: Flags::default(),
            },
            payload,
        }
    }

    /// Builds a response message carrying the request's type and ID.
    pub fn response(rpc_type: RpcType, id: u64, payload: Vec<u8>) -> Message {
        let mut flags = Flags::default();
        flags.set_response();
        Message {
            header: Header {
                rpc_type,
                id,
                flags,
            },
            payload,
        }
    }

    /// Builds a "not supported" error response with an empty payload.
    pub fn not_supported(rpc_type: RpcType, id: u64) -> Message {
        let mut flags = Flags::default();
        flags.set_response();
        flags.set_err_not_supported();
        Message {
            header: Header {
                rpc_type,
                id,
                flags,
            },
            payload: Vec::new(),
        }
    }

    /// Encodes the message into a single wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a message from a wire buffer.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        let header = Header::decode(buf)?;
        Ok(Message {
            header,
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_round_trip() {
        let mut flags = Flags::default();
        flags.set_response();
        let header = Header {
            rpc_type: RpcType::HttpRequest,
            id: 0xdead_beef_cafe,
            flags,
        };
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_layout() {
        let header = Header {
            rpc_type: RpcType::Heartbeat,
            id: 2,
            flags: Flags::from_u16(3),
        };
        let buf = header.encode();
        assert_eq!(buf[0..2], [0, 1]);
        assert_eq!(buf[2..10], [0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(buf[10..12], [0, 3]);
        assert_eq!(buf[12..14], [0, 0]);
    }

    #[test]
    fn test_header_short_buffer() {
        let err = Header::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, RpcError::ShortHeader(4)));
    }

    #[test]
    fn test_header_unknown_type() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&999u16.to_be_bytes());
        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, RpcError::UnknownRpcType(999)));
    }

    #[test]
    fn test_flags() {
        let mut flags = Flags::default();
        assert!(!flags.response());
        assert!(!flags.err_not_supported());

        flags.set_response();
        assert!(flags.response());
        assert!(!flags.err_not_supported());

        flags.set_err_not_supported();
        assert!(flags.response());
        assert!(flags.err_not_supported());
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::request(RpcType::HttpRequest, 7, b"payload".to_vec());
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_not_supported_message() {
        let msg = Message::not_supported(RpcType::Heartbeat, 9);
        assert!(msg.header.flags.response());
        assert!(msg.header.flags.err_not_supported());
        assert!(msg.payload.is_empty());
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(raw_type in 1u16..=2, id in any::<u64>(), flags in any::<u16>()) {
            let header = Header {
                rpc_type: RpcType::from_u16(raw_type).unwrap(),
                id,
                flags: Flags::from_u16(flags),
            };
            let decoded = Header::decode(&header.encode()).unwrap();
            prop_assert_eq!(header, decoded);
        }
    }
}
