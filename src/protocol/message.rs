//! Protocol message definitions
//!
//! Defines the frame data model exchanged between the core and its modules.

use bytes::Bytes;
use std::fmt;

/// Fixed-width binary identifier naming one module on the wire.
///
/// Assigned once by the [`Registry`](crate::registry::Registry) at
/// registration time and immutable thereafter. The all-zero value is
/// reserved and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 4]);

impl Identifier {
    pub const SIZE: usize = 4;

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0
    }

    /// The reserved all-zero identifier, invalid on the wire.
    pub const fn zero() -> Self {
        Self([0; 4])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Single-byte message type carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request a session (first frame on every connection)
    Conn = 0x01,
    /// Session accepted
    ConnAck = 0x02,
    /// Generic acknowledgment
    Ack = 0x03,
    /// Application payload
    Msg = 0x10,
    /// Payload acknowledged; carries the handler's optional reply
    MsgAck = 0x11,
    /// Liveness probe
    Ping = 0xF0,
    /// Liveness response
    Pong = 0xF1,
    /// Graceful close
    Disconnect = 0xFE,
    /// Processing failure
    Error = 0xFF,
    /// Unrecognized type byte. Never encoded; produced only when decoding
    /// fails softly.
    Unknown = 0x00,
}

impl MessageType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x01 => MessageType::Conn,
            0x02 => MessageType::ConnAck,
            0x03 => MessageType::Ack,
            0x10 => MessageType::Msg,
            0x11 => MessageType::MsgAck,
            0xF0 => MessageType::Ping,
            0xF1 => MessageType::Pong,
            0xFE => MessageType::Disconnect,
            0xFF => MessageType::Error,
            _ => MessageType::Unknown,
        }
    }

    /// Whether this type answers an earlier request and should complete a
    /// pending `send_and_await`.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::Ack
                | MessageType::ConnAck
                | MessageType::MsgAck
                | MessageType::Pong
                | MessageType::Error
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Conn => "CONN",
            MessageType::ConnAck => "CONN_ACK",
            MessageType::Ack => "ACK",
            MessageType::Msg => "MSG",
            MessageType::MsgAck => "MSG_ACK",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::Error => "ERROR",
            MessageType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Frame header: sender identifier plus message type. Exactly 5 bytes on
/// the wire, immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub identifier: Identifier,
    pub message_type: MessageType,
}

impl Header {
    pub const SIZE: usize = Identifier::SIZE + 1;

    pub fn new(identifier: Identifier, message_type: MessageType) -> Self {
        Self {
            identifier,
            message_type,
        }
    }
}

/// Opaque payload bytes.
///
/// The UTF-8 view is computed from the same bytes on demand, so the two
/// representations can never diverge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    bytes: Bytes,
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 view of the payload, when the bytes are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(bytes),
        }
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(bytes),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(text.as_bytes()),
        }
    }
}

/// One complete decoded frame: header plus payload.
///
/// The CRC-32 checksum is a wire-only artifact, computed on encode and
/// verified on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    pub fn new(identifier: Identifier, message_type: MessageType, payload: Payload) -> Self {
        Self {
            header: Header::new(identifier, message_type),
            payload,
        }
    }

    pub fn empty(identifier: Identifier, message_type: MessageType) -> Self {
        Self::new(identifier, message_type, Payload::empty())
    }

    pub fn identifier(&self) -> Identifier {
        self.header.identifier
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }
}
