//! Connection-level error types

use protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Reasons a peer connection is torn down
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    
    #[error("Shared secret mismatch")]
    SecretMismatch,
    
    #[error("Invalid server identity: {0}")]
    InvalidIdentity(String),
    
    #[error("Already connected to {0} over a preferred connection")]
    Duplicate(String),
    
    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
}
