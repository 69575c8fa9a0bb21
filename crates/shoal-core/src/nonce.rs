//! Envelope nonce layout.
//!
//! Every envelope starts with a 24-byte cleartext header that is also used
//! as the AEAD nonce for payloads sealed between client and server:
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Cookie (16 bytes)            |S|D|OVF|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Sequence    |
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! S = source client-id, D = destination client-id, OVF = overflow counter.
//! Overflow and sequence together form the 48-bit combined sequence number.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::{ClientId, WireError, COOKIE_LENGTH, NONCE_LENGTH};

/// A channel cookie: 16 random bytes chosen by the sender at handshake
/// start, fixed for the lifetime of the channel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LENGTH]);

impl Cookie {
    /// Generate a fresh random cookie using the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Cookie(bytes)
    }

    pub fn from_bytes(bytes: [u8; COOKIE_LENGTH]) -> Self {
        Cookie(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", hex::encode(self.0))
    }
}

/// The cleartext envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    /// Sender-chosen channel cookie.
    pub cookie: Cookie,
    /// Source client-id.
    pub source: ClientId,
    /// Destination client-id.
    pub destination: ClientId,
    /// Overflow counter (upper 16 bits of the combined sequence number).
    pub overflow: u16,
    /// Sequence counter (lower 32 bits of the combined sequence number).
    pub sequence: u32,
}

impl Nonce {
    /// Build a nonce from a cookie, addresses, and a 48-bit combined
    /// sequence number.
    pub fn new(cookie: Cookie, source: ClientId, destination: ClientId, csn: u64) -> Self {
        Self {
            cookie,
            source,
            destination,
            overflow: ((csn >> 32) & 0xffff) as u16,
            sequence: (csn & 0xffff_ffff) as u32,
        }
    }

    /// The 48-bit combined sequence number (overflow ++ sequence).
    pub fn combined_sequence(&self) -> u64 {
        ((self.overflow as u64) << 32) | self.sequence as u64
    }

    /// Encode the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; NONCE_LENGTH] {
        let mut buf = [0u8; NONCE_LENGTH];
        buf[0..16].copy_from_slice(self.cookie.as_bytes());
        buf[16] = self.source.0;
        buf[17] = self.destination.0;
        buf[18..20].copy_from_slice(&self.overflow.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Decode a header from the start of a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < NONCE_LENGTH {
            return Err(WireError::TooShort(buf.len(), NONCE_LENGTH));
        }

        let mut cookie = [0u8; COOKIE_LENGTH];
        cookie.copy_from_slice(&buf[0..16]);

        Ok(Self {
            cookie: Cookie::from_bytes(cookie),
            source: ClientId(buf[16]),
            destination: ClientId(buf[17]),
            overflow: u16::from_be_bytes([buf[18], buf[19]]),
            sequence: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    /// The message id: the trailing 8 header bytes
    /// (source, destination, overflow, sequence).
    ///
    /// Referenced by `send-error` to name a failed relay attempt.
    pub fn message_id(&self) -> [u8; 8] {
        let encoded = self.encode();
        let mut id = [0u8; 8];
        id.copy_from_slice(&encoded[16..24]);
        id
    }
}
