//! Relaymesh server library
//!
//! Server-to-server relay network: every node listens for peers, dials its
//! configured peers, authenticates them with a shared-secret handshake and
//! relays packets between host applications over AES-GCM encrypted,
//! length-prefixed TCP frames.

pub mod config;
pub mod error;
mod handlers;
pub mod host;
pub mod manager;
pub mod registry;
pub mod session;

pub use config::{Config, NetworkConfig, RemoteServer};
pub use error::SessionError;
pub use host::{HostBindings, InlineExecutor, MainLoop, MainThreadExecutor, PacketListener, PlayerDirectory};
pub use manager::NetworkManager;
pub use protocol;
