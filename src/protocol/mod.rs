//! Protocol module - Defines the wire format for core/module IPC
//!
//! Every frame uses a fixed binary layout:
//! - 4 bytes sender identifier
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - Variable length payload
//! - 4 bytes CRC-32 over the payload (big-endian)

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Maximum payload size (10 MB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;
