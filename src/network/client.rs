//! IPC client
//!
//! Connects a module to the core's socket, identifies itself, and exposes
//! fire-and-forget `send` plus request/response `send_and_await`.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::session::{Session, SessionError, SessionHandle};
use super::IpcConfig;
use crate::protocol::{Frame, Identifier, MessageType, Payload};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Timed out waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("A request is already in flight on this session")]
    RequestInFlight,

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake complete; `peer` is the core's identifier
    Connected { peer: Identifier },
    /// Session ended
    Disconnected { reason: String },
    /// Unsolicited frame from the core (not a reply to a pending request)
    MessageReceived { frame: Frame },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Established,
}

/// Slot for the single permitted outstanding request.
///
/// The wire header carries no correlation field, so only one
/// `send_and_await` may wait at a time; the session loop completes the
/// slot with the next reply-typed frame.
type PendingSlot = Arc<Mutex<Option<oneshot::Sender<Frame>>>>;

/// IPC client: one session to the core, read loop on its own task so a
/// blocked `send_and_await` never stalls frame delivery.
pub struct Client {
    config: IpcConfig,
    /// This module's identifier, stamped into every outbound header
    identifier: Identifier,
    state: Arc<RwLock<ClientState>>,
    /// The core's identifier (after connection)
    peer: Arc<RwLock<Option<Identifier>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    handle: Arc<RwLock<Option<SessionHandle>>>,
    pending: PendingSlot,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl Client {
    pub fn new(config: IpcConfig, identifier: Identifier) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            identifier,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            peer: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            handle: Arc::new(RwLock::new(None)),
            pending: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Dial the core's socket and identify this module.
    ///
    /// The session is promoted to `Established` only after the core
    /// acknowledges the CONN frame.
    pub async fn connect(&self) -> ClientResult<()> {
        // Check and claim the state under one lock, so two concurrent
        // connect calls cannot both pass the guard and dial twice
        {
            let mut state = self.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        let path = self.config.socket_path.clone();
        tracing::debug!("Dialing {}", path.display());

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            UnixStream::connect(&path),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let mut state = self.state.write().await;
                *state = ClientState::Disconnected;
                return Err(ClientError::DialFailed(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
            Err(_) => {
                let mut state = self.state.write().await;
                *state = ClientState::Disconnected;
                return Err(ClientError::DialFailed(format!(
                    "{}: connect timed out",
                    path.display()
                )));
            }
        };

        let mut session = Session::new(stream);
        let peer_id = match session
            .initiate_handshake(self.identifier, self.config.handshake_timeout)
            .await
        {
            Ok(peer_id) => peer_id,
            Err(e) => {
                let mut state = self.state.write().await;
                *state = ClientState::Disconnected;
                return Err(e.into());
            }
        };

        {
            let mut peer = self.peer.write().await;
            *peer = Some(peer_id);
        }

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
        let handle = SessionHandle::new(frame_tx);
        {
            let mut h = self.handle.write().await;
            *h = Some(handle.clone());
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut st = self.shutdown_tx.write().await;
            *st = Some(shutdown_tx);
        }

        {
            let mut state = self.state.write().await;
            *state = ClientState::Established;
        }

        tracing::info!("Connected to core {}", peer_id);
        let _ = self
            .event_tx
            .send(ClientEvent::Connected { peer: peer_id })
            .await;

        let self_id = self.identifier;
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer = self.peer.clone();
        let handle_slot = self.handle.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            // First probe one interval in, not immediately on connect
            let mut liveness = tokio::time::interval_at(
                tokio::time::Instant::now() + config.liveness_interval,
                config.liveness_interval,
            );
            liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut missed_pings: u32 = 0;
            // Probes sent by this loop whose PONG has not come back yet.
            // Those PONGs belong to the loop, not to a pending
            // `send_and_await` (no correlation field on the wire).
            let mut probes_outstanding: u32 = 0;

            let disconnect_reason = loop {
                tokio::select! {
                    result = session.recv_timeout(config.read_timeout) => {
                        match result {
                            Ok(Some(frame)) => {
                                missed_pings = 0;
                                match frame.message_type() {
                                    MessageType::Disconnect => {
                                        break "disconnected by peer".to_string();
                                    }
                                    MessageType::Ping => {
                                        if let Err(e) = session
                                            .send(&Frame::empty(self_id, MessageType::Pong))
                                            .await
                                        {
                                            break format!("pong failed: {}", e);
                                        }
                                    }
                                    MessageType::Pong if probes_outstanding > 0 => {
                                        probes_outstanding -= 1;
                                    }
                                    t if t.is_reply() => {
                                        let waiter = pending.lock().unwrap().take();
                                        match waiter {
                                            Some(tx) => {
                                                let _ = tx.send(frame);
                                            }
                                            None if t == MessageType::Error => {
                                                tracing::warn!(
                                                    "Unsolicited ERROR frame: {}",
                                                    frame.payload.as_str().unwrap_or("<binary>")
                                                );
                                            }
                                            None => {
                                                tracing::trace!("Absorbed {}", t);
                                            }
                                        }
                                    }
                                    MessageType::Msg => {
                                        let _ = event_tx
                                            .send(ClientEvent::MessageReceived { frame })
                                            .await;
                                    }
                                    other => {
                                        tracing::warn!("Unexpected {} frame", other);
                                    }
                                }
                            }
                            Ok(None) => {
                                break "connection closed".to_string();
                            }
                            Err(SessionError::Timeout) => {
                                // Outbound and timer arms restart this read,
                                // so the liveness tick owns idle accounting
                            }
                            Err(e) => {
                                break format!("transport error: {}", e);
                            }
                        }
                    }

                    Some(frame) = frame_rx.recv() => {
                        if let Err(e) = session.send(&frame).await {
                            break format!("send failed: {}", e);
                        }
                    }

                    _ = liveness.tick() => {
                        if session.idle_time() >= config.read_timeout {
                            missed_pings += 1;
                            if missed_pings > config.max_missed_pings {
                                break "liveness timeout".to_string();
                            }
                        }

                        // While a request is in flight its response proves
                        // liveness, so no probe goes out alongside it
                        let slot_free = pending.lock().unwrap().is_none();
                        if slot_free {
                            if let Err(e) = session
                                .send(&Frame::empty(self_id, MessageType::Ping))
                                .await
                            {
                                break format!("ping failed: {}", e);
                            }
                            probes_outstanding += 1;
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        break "client closed".to_string();
                    }
                }
            };

            handle.mark_disconnected();

            // Drop any pending waiter so its caller sees ConnectionClosed
            pending.lock().unwrap().take();

            {
                let mut h = handle_slot.write().await;
                *h = None;
            }
            {
                let mut p = peer.write().await;
                *p = None;
            }
            {
                let mut s = state.write().await;
                *s = ClientState::Disconnected;
            }

            session.close(self_id).await;

            tracing::info!("Session ended: {}", disconnect_reason);
            let _ = event_tx
                .send(ClientEvent::Disconnected {
                    reason: disconnect_reason,
                })
                .await;
        });

        Ok(())
    }

    /// Dial with best-effort retries while no listener is present.
    pub async fn connect_with_retry(&self, attempts: u32, delay: Duration) -> ClientResult<()> {
        let mut last = None;
        for attempt in 1..=attempts.max(1) {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(ClientError::DialFailed(reason)) => {
                    tracing::debug!("Dial attempt {}/{} failed: {}", attempt, attempts, reason);
                    last = Some(ClientError::DialFailed(reason));
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(ClientError::NotConnected))
    }

    /// Encode and enqueue one frame. Fire-and-forget.
    pub async fn send(&self, message_type: MessageType, payload: Payload) -> ClientResult<()> {
        {
            let state = self.state.read().await;
            if *state != ClientState::Established {
                return Err(ClientError::NotConnected);
            }
        }

        let handle = self.handle.read().await;
        let handle = handle.as_ref().ok_or(ClientError::NotConnected)?;

        handle
            .send(Frame::new(self.identifier, message_type, payload))
            .await
            .map_err(|e| ClientError::WriteFailed(e.to_string()))
    }

    /// Send a frame and block until the correlated response arrives or the
    /// timeout elapses.
    ///
    /// The protocol carries no request-ID field, so only one call may wait
    /// per session; a concurrent call fails with `RequestInFlight`.
    pub async fn send_and_await(
        &self,
        message_type: MessageType,
        payload: Payload,
        timeout: Duration,
    ) -> ClientResult<Frame> {
        {
            let state = self.state.read().await;
            if *state != ClientState::Established {
                return Err(ClientError::NotConnected);
            }
        }

        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return Err(ClientError::RequestInFlight);
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(tx);
            rx
        };

        if let Err(e) = self.send(message_type, payload).await {
            self.pending.lock().unwrap().take();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().unwrap().take();
                Err(ClientError::Timeout)
            }
        }
    }

    /// Close the session: best-effort DISCONNECT, then release. Idempotent.
    pub async fn close(&self) {
        let tx = {
            let mut st = self.shutdown_tx.write().await;
            st.take()
        };

        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// The core's identifier, once connected.
    pub async fn peer(&self) -> Option<Identifier> {
        *self.peer.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Established
    }
}
