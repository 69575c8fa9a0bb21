//! Outgoing combined sequence numbers.
//!
//! A combined sequence number (CSN) is 48 bits: a 16-bit overflow counter
//! over a 32-bit sequence counter. The first CSN on a channel has a random
//! sequence and zero overflow; the overflow half only grows when the
//! sequence wraps. Once the 48-bit space is exhausted the channel is dead —
//! the connection must close rather than reuse a nonce.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::CryptoError;

/// Largest representable combined sequence number.
pub const CSN_MAX: u64 = (1 << 48) - 1;

/// Generator for the server side of one channel.
#[derive(Debug)]
pub struct CombinedSequence {
    /// Next value to hand out; `None` once the space is exhausted.
    next: Option<u64>,
}

impl CombinedSequence {
    /// Create a generator starting at a random 32-bit sequence with zero
    /// overflow.
    pub fn random() -> Self {
        Self {
            next: Some(OsRng.next_u32() as u64),
        }
    }

    /// Return the next combined sequence number.
    ///
    /// Fails with [`CryptoError::CsnExhausted`] once the 48-bit space has
    /// been used up; the caller must close the channel.
    pub fn next(&mut self) -> Result<u64, CryptoError> {
        let value = self.next.ok_or(CryptoError::CsnExhausted)?;
        self.next = if value == CSN_MAX { None } else { Some(value + 1) };
        Ok(value)
    }
}
