//! Length-prefixed wire codec
//!
//! Frame layout (big-endian):
//!
//! ```text
//! [4 bytes: length N] [N bytes: body]
//! ```
//!
//! With encryption the body is `base64(nonce || ciphertext || tag)` of the
//! packet JSON; without it the body is the raw JSON.

use crate::constants::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::crypto::AesGcmCipher;
use crate::error::ProtocolError;
use crate::packets::NetworkPacket;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Codec turning a byte stream into `NetworkPacket`s and back
#[derive(Debug, Clone)]
pub struct PacketCodec {
    cipher: Option<Arc<AesGcmCipher>>,
}

impl PacketCodec {
    /// `None` disables the AES-GCM layer (trusted networks, debugging)
    pub fn new(cipher: Option<Arc<AesGcmCipher>>) -> Self {
        Self { cipher }
    }

    pub fn encrypted(cipher: Arc<AesGcmCipher>) -> Self {
        Self::new(Some(cipher))
    }

    pub fn plaintext() -> Self {
        Self::new(None)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize and (optionally) encrypt a packet into a frame body
    pub fn seal(&self, packet: &NetworkPacket) -> Result<Vec<u8>, ProtocolError> {
        let json = packet.to_json()?;
        match &self.cipher {
            Some(cipher) => Ok(STANDARD.encode(cipher.encrypt(&json)?).into_bytes()),
            None => Ok(json),
        }
    }

    /// Frame body length `seal` would produce, without encrypting
    pub fn sealed_len(&self, packet: &NetworkPacket) -> Result<usize, ProtocolError> {
        let json_len = packet.to_json()?.len();
        if !self.is_encrypted() {
            return Ok(json_len);
        }
        base64::encoded_len(NONCE_SIZE + json_len + TAG_SIZE, true).ok_or(ProtocolError::FrameTooLarge {
            max: MAX_FRAME_SIZE,
            actual: usize::MAX,
        })
    }

    /// Whether `packet` fits in a single frame
    pub fn fits(&self, packet: &NetworkPacket) -> Result<bool, ProtocolError> {
        Ok(self.sealed_len(packet)? <= MAX_FRAME_SIZE)
    }

    /// Reverse of `seal`; any failure rejects the whole frame
    pub fn open(&self, body: &[u8]) -> Result<NetworkPacket, ProtocolError> {
        match &self.cipher {
            Some(cipher) => {
                let blob = STANDARD.decode(body)?;
                NetworkPacket::from_json(&cipher.decrypt(&blob)?)
            }
            None => NetworkPacket::from_json(body),
        }
    }
}

impl Decoder for PacketCodec {
    type Item = NetworkPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                max: MAX_FRAME_SIZE,
                actual: len,
            });
        }

        let frame_len = LENGTH_PREFIX_SIZE + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(len);
        self.open(&body).map(Some)
    }
}

impl Encoder<NetworkPacket> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: NetworkPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = self.seal(&packet)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                max: MAX_FRAME_SIZE,
                actual: body.len(),
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
