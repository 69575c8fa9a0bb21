//! The wire unit: a cleartext header plus a variable-length payload.
//!
//! Frames on the stream are length-prefixed (u32 big-endian, prefix not
//! included in the length). The payload is either ciphertext sealed between
//! client and server, a plaintext handshake payload, or an opaque
//! client-to-client blob the server forwards without inspection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::nonce::Nonce;
use crate::{WireError, MAX_FRAME_SIZE, NONCE_LENGTH};

/// A decoded envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub nonce: Nonce,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(nonce: Nonce, payload: impl Into<Bytes>) -> Self {
        Self {
            nonce,
            payload: payload.into(),
        }
    }

    /// Encode header + payload into a single frame body (no length prefix).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NONCE_LENGTH + self.payload.len());
        buf.put_slice(&self.nonce.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame body into an envelope.
    ///
    /// The payload may be empty; a frame shorter than the header is
    /// malformed, as is one exceeding the frame size limit.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, WireError> {
        if bytes.len() < NONCE_LENGTH {
            return Err(WireError::TooShort(bytes.len(), NONCE_LENGTH));
        }
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(bytes.len(), MAX_FRAME_SIZE));
        }

        let nonce = Nonce::decode(&bytes)?;
        Ok(Self {
            nonce,
            payload: bytes.slice(NONCE_LENGTH..),
        })
    }
}
