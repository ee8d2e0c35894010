//! Protocol constants

use std::time::Duration;

/// Size of the big-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// AES-256 key size (32 bytes, full SHA-256 digest)
pub const KEY_SIZE: usize = 32;

/// Nonce size (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Default listen port for the mesh
pub const DEFAULT_PORT: u16 = 25100;

/// Delay before the first outbound dial scan
pub const DEFAULT_DIAL_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Fixed delay between outbound dial scans
pub const DEFAULT_DIAL_INTERVAL: Duration = Duration::from_secs(10);

/// A connection that has not authenticated within this window is closed
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound TCP connect attempts give up after this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
