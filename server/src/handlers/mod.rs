//! Packet handlers for the handshake and for authenticated traffic

pub mod dispatch;
pub mod handshake;

pub use dispatch::dispatch;
pub use handshake::{handle_handshake, handle_handshake_ok};
