//! Session handling for core/module IPC
//!
//! One session per connection, owning:
//! - the stream and its frame encoding/decoding
//! - the peer's claimed identifier (unset until validated)
//! - the connection lifecycle state machine

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::protocol::{CodecError, Decoder, Encoder, Frame, Identifier, MessageType, Payload};
use crate::registry::{Registry, RegistryError};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Session closed")]
    Closed,

    #[error("Read timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, no validated frame yet
    Connecting,
    /// Peer identifier validated
    Established,
    /// DISCONNECT sent or received, or a fatal decode error occurred
    Closing,
    /// Terminal; stream released
    Closed,
}

/// Callback invoked for every MSG frame; the optional reply rides back in
/// the MSG_ACK payload.
pub type MessageHandler = Arc<dyn Fn(Identifier, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// The live state of one connection between two IPC endpoints
pub struct Session {
    stream: UnixStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Peer identifier, populated once the handshake validates it
    peer: Option<Identifier>,
    state: SessionState,
    /// Instant of the last inbound frame
    last_activity: Instant,
}

impl Session {
    /// Wrap an established stream; the session starts in `Connecting`.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            peer: None,
            state: SessionState::Connecting,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The peer's validated identifier, if the handshake completed.
    pub fn peer(&self) -> Option<Identifier> {
        self.peer
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Time since the last frame arrived from the peer.
    ///
    /// Counts inbound traffic only; writing to a dead peer succeeds for as
    /// long as the socket buffer has room, so outbound frames prove nothing
    /// about liveness.
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Encode and write one frame.
    pub async fn send(&mut self, frame: &Frame) -> SessionResult<()> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        self.write_buf.clear();
        self.encoder.encode(frame, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean close between frames; a close
    /// mid-frame is classified as `FrameTooShort` or `PayloadTruncated`.
    pub async fn recv(&mut self) -> SessionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.last_activity = Instant::now();
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                return match self.decoder.eof_error(self.read_buf.len()) {
                    Some(err) => Err(err.into()),
                    None => Ok(None),
                };
            }

            self.read_buf.extend_from_slice(&buf[..n]);
        }
    }

    /// Read the next frame with a bounded wait.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> SessionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Server-side handshake: the first frame must be CONN with an
    /// identifier the registry knows. Rejections send a best-effort ERROR
    /// frame before the session transitions toward `Closed`.
    pub async fn accept_handshake(
        &mut self,
        registry: &Registry,
        self_id: Identifier,
        timeout: Duration,
    ) -> SessionResult<Identifier> {
        let frame = match self.recv_timeout(timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.state = SessionState::Closed;
                return Err(SessionError::HandshakeFailed(
                    "connection closed before identifying frame".to_string(),
                ));
            }
            Err(err) => {
                self.reject(self_id, &err.to_string()).await;
                return Err(err);
            }
        };

        if frame.message_type() != MessageType::Conn {
            let reason = format!("expected CONN, got {}", frame.message_type());
            self.reject(self_id, &reason).await;
            return Err(SessionError::HandshakeFailed(reason));
        }

        let peer_id = frame.identifier();
        if !registry.contains(peer_id) {
            self.reject(self_id, "unknown identifier").await;
            return Err(RegistryError::UnknownIdentifier(peer_id).into());
        }

        self.send(&Frame::new(
            self_id,
            MessageType::ConnAck,
            Payload::from(&self_id.to_bytes()[..]),
        ))
        .await?;

        self.peer = Some(peer_id);
        self.state = SessionState::Established;
        Ok(peer_id)
    }

    /// Client-side handshake: send CONN carrying our identifier and wait
    /// for the server's CONN_ACK.
    pub async fn initiate_handshake(
        &mut self,
        self_id: Identifier,
        timeout: Duration,
    ) -> SessionResult<Identifier> {
        self.send(&Frame::empty(self_id, MessageType::Conn)).await?;

        let frame = match self.recv_timeout(timeout).await? {
            Some(frame) => frame,
            None => {
                self.state = SessionState::Closed;
                return Err(SessionError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
        };

        match frame.message_type() {
            MessageType::ConnAck => {
                let peer_id = frame.identifier();
                self.peer = Some(peer_id);
                self.state = SessionState::Established;
                tracing::debug!("Session established with {}", peer_id);
                Ok(peer_id)
            }
            MessageType::Error => {
                self.state = SessionState::Closing;
                Err(SessionError::HandshakeFailed(
                    frame
                        .payload
                        .as_str()
                        .unwrap_or("connection rejected")
                        .to_string(),
                ))
            }
            other => {
                self.state = SessionState::Closing;
                Err(SessionError::HandshakeFailed(format!(
                    "expected CONN_ACK, got {}",
                    other
                )))
            }
        }
    }

    /// Best-effort ERROR frame followed by the transition toward `Closed`.
    pub async fn reject(&mut self, self_id: Identifier, reason: &str) {
        self.state = SessionState::Closing;
        let _ = self
            .send(&Frame::new(
                self_id,
                MessageType::Error,
                Payload::from(reason),
            ))
            .await;
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
    }

    /// Close the session: best-effort DISCONNECT, then release the stream.
    /// Idempotent.
    pub async fn close(&mut self, self_id: Identifier) {
        if self.state == SessionState::Closed {
            return;
        }

        self.state = SessionState::Closing;
        let _ = self
            .send(&Frame::empty(self_id, MessageType::Disconnect))
            .await;
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
    }
}

/// A handle for writing frames to a session from outside its read loop.
///
/// The loop owns the stream exclusively; handles enqueue frames through a
/// channel the loop drains.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<Frame>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Enqueue a frame for transmission.
    pub async fn send(&self, frame: Frame) -> SessionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        self.sender
            .send(frame)
            .await
            .map_err(|_| SessionError::SendChannelClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the session as gone; subsequent sends fail with `Closed`.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
