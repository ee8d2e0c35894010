//! Cryptographic channel for the relaymesh protocol
//! Uses AES-256-GCM with a key derived from the configured shared secret

use crate::constants::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use std::fmt;

/// Derive the 256-bit working key from the shared secret
///
/// The full SHA-256 digest of the UTF-8 secret is the key, so two nodes
/// configured with the same secret hold the same key without exchanging it.
pub fn derive_key(secret: &str) -> [u8; KEY_SIZE] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Generate a new random shared secret for configs that have none
pub fn generate_secret() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// AES-256-GCM channel holding one derived key for the process lifetime
///
/// Safe to share between connections: every call is independent and draws a
/// fresh random nonce.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Build a channel from the configured shared secret
    pub fn from_secret(secret: &str) -> Self {
        Self::from_key(&derive_key(secret))
    }

    pub fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&(*key).into()),
        }
    }

    /// Encrypt a plaintext
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - `nonce (12) || ciphertext || tag (16)`
    /// * `Err(CryptoError)` - Encryption failed
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use rand::Rng;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `nonce || ciphertext || tag` blob
    ///
    /// Fails with `CryptoError::Authentication` if the tag does not verify.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort {
                expected: NONCE_SIZE + TAG_SIZE,
                actual: blob.len(),
            });
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}
