//! Network module - Unix-socket transport between the core and its modules
//!
//! Provides:
//! - Server for accepting module connections at a well-known path
//! - Client for connecting a module to the core
//! - Per-connection session state machine and frame routing

mod server;
mod client;
mod session;

pub use server::*;
pub use client::*;
pub use session::*;

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for IPC endpoints
///
/// Loading these values from files or flags is the caller's concern; the
/// endpoints only consume the struct.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Filesystem path of the rendezvous socket
    pub socket_path: PathBuf,
    /// How long the client waits for the dial to complete
    pub connect_timeout: Duration,
    /// How long either side waits for the identifying frame exchange
    pub handshake_timeout: Duration,
    /// Bound applied to every read in a session loop, and the inbound-idle
    /// threshold past which a liveness check counts as missed
    pub read_timeout: Duration,
    /// Cadence of the per-session liveness timer (and of client PINGs)
    pub liveness_interval: Duration,
    /// Consecutive missed liveness checks before a session is declared dead
    pub max_missed_pings: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/coreipc.sock"),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(1),
            max_missed_pings: 3,
        }
    }
}

impl IpcConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_liveness_interval(mut self, liveness_interval: Duration) -> Self {
        self.liveness_interval = liveness_interval;
        self
    }

    pub fn with_max_missed_pings(mut self, max_missed_pings: u32) -> Self {
        self.max_missed_pings = max_missed_pings;
        self
    }
}
