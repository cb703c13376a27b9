//! IPC server
//!
//! Owns the rendezvous socket: removes stale artifacts, binds the listener,
//! accepts connections, and supervises one session task per module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};

use super::session::{
    MessageHandler, Session, SessionError, SessionHandle, SessionResult,
};
use super::IpcConfig;
use crate::protocol::{Frame, Identifier, MessageType, Payload};
use crate::registry::Registry;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No session for identifier: {0}")]
    UnknownPeer(Identifier),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listener bound and accepting
    Started { path: PathBuf },
    /// Listener closed, socket artifact removed
    Stopped,
    /// A module completed the identifying handshake
    ModuleConnected { identifier: Identifier, name: String },
    /// A module's session ended
    ModuleDisconnected { identifier: Identifier, reason: String },
}

/// A connected module as seen by the server
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub identifier: Identifier,
    pub name: String,
    /// Handle for sending frames to this module
    pub handle: SessionHandle,
}

/// IPC server: one listening socket, one session task per accepted
/// connection.
pub struct Server {
    config: IpcConfig,
    /// The core's own identifier, stamped into every outbound header
    identifier: Identifier,
    registry: Arc<Registry>,
    handler: MessageHandler,
    /// Live sessions keyed by validated module identifier
    peers: Arc<RwLock<HashMap<Identifier, PeerInfo>>>,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Broadcast to the accept loop and every live session
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    pub fn new(
        config: IpcConfig,
        identifier: Identifier,
        registry: Arc<Registry>,
        handler: MessageHandler,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            identifier,
            registry,
            handler,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Any pre-existing artifact at the socket path (a stale socket from a
    /// crashed run) is removed first.
    pub async fn start(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let path = self.config.socket_path.clone();

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale socket at {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::BindFailed(format!(
                    "cannot clear stale socket at {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            ServerError::BindFailed(format!("failed to bind {}: {}", path.display(), e))
        })?;

        tracing::info!("Server listening on {}", path.display());

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self
            .event_tx
            .send(ServerEvent::Started { path: path.clone() })
            .await;

        let config = self.config.clone();
        let self_id = self.identifier;
        let registry = self.registry.clone();
        let handler = self.handler.clone();
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                tracing::debug!("Accepted connection");

                                let config = config.clone();
                                let registry = registry.clone();
                                let handler = handler.clone();
                                let peers = peers.clone();
                                let event_tx = event_tx.clone();
                                let session_shutdown = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_session(
                                        stream,
                                        config,
                                        self_id,
                                        registry,
                                        handler,
                                        peers,
                                        event_tx,
                                        session_shutdown,
                                    )
                                    .await
                                    {
                                        tracing::warn!("Session ended with error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove socket at {}: {}", path.display(), e);
                }
            }

            let mut running = running.write().await;
            *running = false;

            let _ = event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(())
    }

    /// Stop the server: signal all sessions toward `Closing`, close the
    /// listener, remove the socket artifact. Idempotent.
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };

        let _ = tx.send(());
    }

    /// Connected modules.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    /// Send a frame to one connected module.
    pub async fn send_to(
        &self,
        identifier: Identifier,
        message_type: MessageType,
        payload: Payload,
    ) -> ServerResult<()> {
        let peers = self.peers.read().await;
        let peer = peers
            .get(&identifier)
            .ok_or(ServerError::UnknownPeer(identifier))?;

        peer.handle
            .send(Frame::new(self.identifier, message_type, payload))
            .await?;
        Ok(())
    }

    /// Send a frame to every connected module.
    pub async fn broadcast(&self, message_type: MessageType, payload: Payload) {
        let peers = self.peers.read().await;
        for peer in peers.values() {
            let frame = Frame::new(self.identifier, message_type, payload.clone());
            let _ = peer.handle.send(frame).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Run one module session: handshake, then the frame loop.
///
/// Frames are processed strictly in arrival order; the handler for one MSG
/// completes before the next frame is read.
#[allow(clippy::too_many_arguments)]
async fn handle_session(
    stream: UnixStream,
    config: IpcConfig,
    self_id: Identifier,
    registry: Arc<Registry>,
    handler: MessageHandler,
    peers: Arc<RwLock<HashMap<Identifier, PeerInfo>>>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> SessionResult<()> {
    let mut session = Session::new(stream);

    let peer_id = session
        .accept_handshake(&registry, self_id, config.handshake_timeout)
        .await?;
    let peer_name = registry.resolve(peer_id)?;

    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
    let handle = SessionHandle::new(frame_tx);

    {
        let mut peers = peers.write().await;
        peers.insert(
            peer_id,
            PeerInfo {
                identifier: peer_id,
                name: peer_name.clone(),
                handle: handle.clone(),
            },
        );
    }

    tracing::info!("Module '{}' connected as {}", peer_name, peer_id);
    let _ = event_tx
        .send(ServerEvent::ModuleConnected {
            identifier: peer_id,
            name: peer_name.clone(),
        })
        .await;

    // Liveness runs off its own timer: the read below restarts whenever an
    // outbound frame or shutdown signal wins the select, so a busy outbound
    // path must not be able to postpone idle detection
    let mut liveness = tokio::time::interval_at(
        tokio::time::Instant::now() + config.liveness_interval,
        config.liveness_interval,
    );
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut missed_pings: u32 = 0;

    let disconnect_reason = loop {
        tokio::select! {
            result = session.recv_timeout(config.read_timeout) => {
                match result {
                    Ok(Some(frame)) => {
                        missed_pings = 0;
                        match frame.message_type() {
                            MessageType::Disconnect => {
                                break "disconnect requested".to_string();
                            }
                            MessageType::Ping => {
                                if let Err(e) = session
                                    .send(&Frame::empty(self_id, MessageType::Pong))
                                    .await
                                {
                                    break format!("pong failed: {}", e);
                                }
                            }
                            MessageType::Msg => {
                                let reply = handler(peer_id, frame.payload.as_bytes());
                                let payload = reply.map(Payload::from).unwrap_or_default();
                                if let Err(e) = session
                                    .send(&Frame::new(self_id, MessageType::MsgAck, payload))
                                    .await
                                {
                                    break format!("ack failed: {}", e);
                                }
                            }
                            MessageType::Pong
                            | MessageType::Ack
                            | MessageType::MsgAck
                            | MessageType::ConnAck => {
                                tracing::trace!("{} from {}", frame.message_type(), peer_id);
                            }
                            MessageType::Error => {
                                tracing::warn!(
                                    "ERROR frame from {}: {}",
                                    peer_id,
                                    frame.payload.as_str().unwrap_or("<binary>")
                                );
                            }
                            MessageType::Conn | MessageType::Unknown => {
                                let reason =
                                    format!("unexpected {} frame", frame.message_type());
                                session.reject(self_id, &reason).await;
                                break reason;
                            }
                        }
                    }
                    Ok(None) => {
                        break "connection closed".to_string();
                    }
                    Err(SessionError::Timeout) => {
                        // Idle accounting happens on the liveness timer
                    }
                    Err(SessionError::Codec(err)) => {
                        tracing::warn!("Codec error from {}: {}", peer_id, err);
                        session.reject(self_id, &err.to_string()).await;
                        break format!("codec error: {}", err);
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
                    if let Err(e) = session
                        .send(&Frame::empty(self_id, MessageType::Ping))
                        .await
                    {
                        break format!("ping failed: {}", e);
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                break "server shutting down".to_string();
            }
        }
    };

    handle.mark_disconnected();

    {
        let mut peers = peers.write().await;
        peers.remove(&peer_id);
    }

    session.close(self_id).await;

    tracing::info!("Module '{}' disconnected: {}", peer_name, disconnect_reason);
    let _ = event_tx
        .send(ServerEvent::ModuleDisconnected {
            identifier: peer_id,
            reason: disconnect_reason,
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoder, Encoder};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_handler() -> MessageHandler {
        Arc::new(|_, payload| Some(payload.to_vec()))
    }

    fn test_server(dir: &tempfile::TempDir) -> (Server, Arc<Registry>, Identifier) {
        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let config = IpcConfig::new(dir.path().join("core.sock"));
        let server = Server::new(config, core_id, registry.clone(), echo_handler());
        (server, registry, core_id)
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _registry, _core_id) = test_server(&dir);
        let path = dir.path().join("core.sock");

        assert!(!server.is_running().await);
        server.start().await.unwrap();
        assert!(server.is_running().await);
        assert!(path.exists());

        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));

        server.stop().await;
        // Idempotent stop
        server.stop().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_running().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_removed_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.sock");
        std::fs::write(&path, b"stale").unwrap();

        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let mut server = Server::new(
            IpcConfig::new(&path),
            core_id,
            registry,
            echo_handler(),
        );

        server.start().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_typed() {
        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let mut server = Server::new(
            IpcConfig::new("/nonexistent-dir/core.sock"),
            core_id,
            registry,
            echo_handler(),
        );

        assert!(matches!(
            server.start().await,
            Err(ServerError::BindFailed(_))
        ));
        assert!(!server.is_running().await);
    }

    /// A raw client that speaks the wire format directly, for probing the
    /// server without going through `Client`.
    struct RawClient {
        stream: tokio::net::UnixStream,
        decoder: Decoder,
        buf: BytesMut,
    }

    impl RawClient {
        async fn connect(path: &std::path::Path) -> Self {
            Self {
                stream: tokio::net::UnixStream::connect(path).await.unwrap(),
                decoder: Decoder::new(),
                buf: BytesMut::new(),
            }
        }

        async fn send_frame(&mut self, frame: &Frame) {
            let mut out = BytesMut::new();
            Encoder::new().encode(frame, &mut out).unwrap();
            self.stream.write_all(&out).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn recv_frame(&mut self) -> Option<Frame> {
            loop {
                match self.decoder.decode(&mut self.buf) {
                    Ok(Some(frame)) => return Some(frame),
                    Ok(None) => {}
                    Err(_) => return None,
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    #[tokio::test]
    async fn test_corrupted_checksum_gets_error_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, registry, core_id) = test_server(&dir);
        let module_id = registry.register("module").unwrap();
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;

        raw.send_frame(&Frame::empty(module_id, MessageType::Conn))
            .await;
        let ack = raw.recv_frame().await.unwrap();
        assert_eq!(ack.message_type(), MessageType::ConnAck);
        assert_eq!(ack.identifier(), core_id);

        // Encode a valid MSG frame, then corrupt its checksum bytes
        let mut out = BytesMut::new();
        Encoder::new()
            .encode(
                &Frame::new(module_id, MessageType::Msg, Payload::from("evil")),
                &mut out,
            )
            .unwrap();
        let last = out.len() - 1;
        out[last] ^= 0xFF;
        raw.send_raw(&out).await;

        // Bounded wait: the server must answer with ERROR, never hang
        let reply = tokio::time::timeout(Duration::from_secs(2), raw.recv_frame())
            .await
            .expect("server must respond before the timeout")
            .expect("expected an ERROR frame");
        assert_eq!(reply.message_type(), MessageType::Error);

        // The session transitions toward Closing: the stream ends
        let eof = tokio::time::timeout(Duration::from_secs(2), raw.recv_frame())
            .await
            .unwrap();
        assert!(eof.is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _registry, _core_id) = test_server(&dir);
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;

        let bogus = Identifier::from_bytes([7, 7, 7, 7]);
        raw.send_frame(&Frame::empty(bogus, MessageType::Conn)).await;

        let reply = tokio::time::timeout(Duration::from_secs(2), raw.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), MessageType::Error);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, registry, _core_id) = test_server(&dir);
        let module_id = registry.register("module").unwrap();
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;

        raw.send_frame(&Frame::empty(module_id, MessageType::Conn))
            .await;
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::ConnAck
        );

        raw.send_frame(&Frame::empty(module_id, MessageType::Ping))
            .await;
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::Pong
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_handler_ordering_within_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let module_id = registry.register("module").unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_ref = order.clone();
        let handler: MessageHandler = Arc::new(move |_, payload| {
            order_ref.lock().unwrap().push(payload.to_vec());
            None
        });

        let config = IpcConfig::new(dir.path().join("core.sock"));
        let mut server = Server::new(config, core_id, registry, handler);
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;
        raw.send_frame(&Frame::empty(module_id, MessageType::Conn))
            .await;
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::ConnAck
        );

        // Write both frames back to back, before reading any ack
        raw.send_frame(&Frame::new(module_id, MessageType::Msg, Payload::from("A")))
            .await;
        raw.send_frame(&Frame::new(module_id, MessageType::Msg, Payload::from("B")))
            .await;

        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::MsgAck
        );
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::MsgAck
        );

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec()]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_module_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let module_id = registry.register("module").unwrap();
        let config = IpcConfig::new(dir.path().join("core.sock"))
            .with_read_timeout(Duration::from_millis(300))
            .with_liveness_interval(Duration::from_millis(100))
            .with_max_missed_pings(2);
        let mut server = Server::new(config, core_id, registry, echo_handler());
        let mut events = server.take_event_receiver().unwrap();
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;
        raw.send_frame(&Frame::empty(module_id, MessageType::Conn))
            .await;
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::ConnAck
        );

        // The module stops talking but keeps the socket open; the server
        // must notice within the missed-ping budget, not wait forever
        let reason = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await.unwrap() {
                    ServerEvent::ModuleDisconnected { identifier, reason } => {
                        assert_eq!(identifier, module_id);
                        break reason;
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("server never reaped the silent module");

        assert_eq!(reason, "liveness timeout");
        assert!(server.peers().await.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_outbound_traffic_does_not_mask_dead_module() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let core_id = registry.register("core").unwrap();
        let module_id = registry.register("module").unwrap();
        let config = IpcConfig::new(dir.path().join("core.sock"))
            .with_read_timeout(Duration::from_millis(300))
            .with_liveness_interval(Duration::from_millis(100))
            .with_max_missed_pings(2);
        let mut server = Server::new(config, core_id, registry, echo_handler());
        let mut events = server.take_event_receiver().unwrap();
        server.start().await.unwrap();

        let path = dir.path().join("core.sock");
        let mut raw = RawClient::connect(&path).await;
        raw.send_frame(&Frame::empty(module_id, MessageType::Conn))
            .await;
        assert_eq!(
            raw.recv_frame().await.unwrap().message_type(),
            MessageType::ConnAck
        );

        let waiter = tokio::spawn(async move {
            loop {
                match events.recv().await.unwrap() {
                    ServerEvent::ModuleDisconnected { reason, .. } => break reason,
                    _ => {}
                }
            }
        });

        // Keep the outbound path busy the whole time; the module neither
        // reads nor writes, and the steady writes must not reset the idle
        // clock
        let mut waited = Duration::ZERO;
        while !waiter.is_finished() {
            assert!(
                waited < Duration::from_secs(3),
                "outbound traffic masked the dead module"
            );
            server
                .broadcast(MessageType::Msg, Payload::from("tick"))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }

        assert_eq!(waiter.await.unwrap(), "liveness timeout");
        assert!(server.peers().await.is_empty());

        server.stop().await;
    }
}
