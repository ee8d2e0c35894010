//! Relaymesh Protocol Library
//!
//! Shared protocol definitions for the relaymesh server-to-server network.
//! This includes the packet model, the AES-GCM channel, and the
//! length-prefixed wire codec.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod packets;

pub use codec::PacketCodec;
pub use constants::*;
pub use crypto::AesGcmCipher;
pub use error::{CryptoError, ProtocolError};
pub use packets::{NetworkPacket, PacketBody, PacketType};
