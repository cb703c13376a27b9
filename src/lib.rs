//! coreipc - Framed IPC between a core process and module processes
//!
//! The core listens on a Unix domain socket; each module process dials it,
//! identifies itself with a registered 4-byte identifier, and exchanges
//! checksummed binary frames. Payloads are opaque to this layer: it frames,
//! addresses, verifies, and routes them, nothing more.
//!
//! Wire layout of every frame:
//!
//! ```text
//! [identifier: 4][type: 1][payload length: 4 BE][payload][crc32: 4 BE]
//! ```
//!
//! # Example
//!
//! ```no_run
//! use coreipc::{Client, IpcConfig, MessageType, Payload, Registry, Server};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(Registry::new());
//! let core_id = registry.register("core")?;
//! let module_id = registry.register("threat-intel")?;
//!
//! let config = IpcConfig::new("/tmp/core.sock");
//! let handler: coreipc::MessageHandler =
//!     Arc::new(|_sender, payload| Some(payload.to_vec()));
//!
//! let mut server = Server::new(config.clone(), core_id, registry, handler);
//! server.start().await?;
//!
//! let client = Client::new(config, module_id);
//! client.connect().await?;
//! let reply = client
//!     .send_and_await(MessageType::Msg, Payload::from("ping"), Duration::from_secs(2))
//!     .await?;
//! println!("reply: {:?}", reply.payload.as_str());
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod protocol;
pub mod registry;

pub use network::{
    Client, ClientError, ClientEvent, ClientState, IpcConfig, MessageHandler, PeerInfo, Server,
    ServerError, ServerEvent, Session, SessionError, SessionHandle, SessionState,
};
pub use protocol::{Frame, Header, Identifier, MessageType, Payload};
pub use registry::{Registry, RegistryError};
