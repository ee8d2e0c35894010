//! Protocol error types

use thiserror::Error;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    
    #[error("Authentication failed (tampered data, wrong key or corrupted frame)")]
    Authentication,
    
    #[error("Encrypted blob too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Errors raised while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("Frame too large: maximum {max}, got {actual}")]
    FrameTooLarge { max: usize, actual: usize },
    
    #[error("Invalid base64 frame body: {0}")]
    Base64(#[from] base64::DecodeError),
    
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    
    #[error("Invalid payload for {packet_type}: {reason}")]
    InvalidPayload { packet_type: &'static str, reason: String },
}
