//! Protocol codec for encoding/decoding frames
//!
//! Implements the fixed binary layout so that any implementation on either
//! end of the socket decodes the same bytes:
//!
//! `[identifier: 4][type: 1][payload length: 4 BE][payload][crc32: 4 BE]`
//!
//! The CRC-32 is computed over the payload bytes only.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{Frame, Header, Identifier, MessageType, Payload, MAX_PAYLOAD_SIZE};

/// Header plus length prefix: identifier(4) + type(1) + length(4) = 9 bytes
pub const FRAME_PREAMBLE_SIZE: usize = Header::SIZE + 4;

/// Trailing CRC-32 over the payload bytes
pub const CHECKSUM_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too short: stream closed with {0} of {FRAME_PREAMBLE_SIZE} preamble bytes")]
    FrameTooShort(usize),

    #[error("Payload truncated: stream closed with {received} of {expected} body bytes")]
    PayloadTruncated { expected: usize, received: usize },

    #[error("Checksum mismatch from {}: expected {expected:#010x}, got {actual:#010x}", .header.identifier)]
    ChecksumMismatch {
        /// Decoded header, still usable to address an ERROR response.
        header: Header,
        expected: u32,
        actual: u32,
    },

    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes frames into the wire format
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into a buffer
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = frame.payload.as_bytes();

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
        }

        buf.put_slice(&frame.header.identifier.to_bytes());
        buf.put_u8(frame.header.message_type.to_u8());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.put_u32(crc32fast::hash(payload));

        Ok(())
    }
}

/// Decodes frames from the wire format
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Preamble,
    Body {
        header: Header,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Preamble,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Preamble => {
                    if buf.len() < FRAME_PREAMBLE_SIZE {
                        return Ok(None);
                    }

                    let identifier = Identifier::from_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    let message_type = MessageType::from_u8(buf[4]);
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

                    if length > MAX_PAYLOAD_SIZE {
                        return Err(CodecError::PayloadTooLarge(length, MAX_PAYLOAD_SIZE));
                    }

                    buf.advance(FRAME_PREAMBLE_SIZE);

                    self.state = DecodeState::Body {
                        header: Header::new(identifier, message_type),
                        length,
                    };
                }
                DecodeState::Body { header, length } => {
                    if buf.len() < *length + CHECKSUM_SIZE {
                        return Ok(None);
                    }

                    let payload = buf.split_to(*length).freeze();
                    let expected = buf.get_u32();
                    let actual = crc32fast::hash(&payload);
                    let header = *header;

                    self.state = DecodeState::Preamble;

                    if expected != actual {
                        return Err(CodecError::ChecksumMismatch {
                            header,
                            expected,
                            actual,
                        });
                    }

                    return Ok(Some(Frame {
                        header,
                        payload: Payload::from(payload),
                    }));
                }
            }
        }
    }

    /// Classify a stream close that happened mid-frame.
    ///
    /// `buffered` is the number of undecoded bytes left in the read buffer.
    /// Returns `None` when the close fell on a clean frame boundary.
    pub fn eof_error(&self, buffered: usize) -> Option<CodecError> {
        match &self.state {
            DecodeState::Preamble => {
                if buffered == 0 {
                    None
                } else {
                    Some(CodecError::FrameTooShort(buffered))
                }
            }
            DecodeState::Body { length, .. } => Some(CodecError::PayloadTruncated {
                expected: *length + CHECKSUM_SIZE,
                received: buffered,
            }),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
