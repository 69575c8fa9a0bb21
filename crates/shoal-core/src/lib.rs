//! Core Shoal signaling protocol types, framing, and constants.
//!
//! This crate provides:
//! - The client-id address space shared by every path
//! - Nonce layout (cookie, addresses, combined sequence number)
//! - Envelope encoding for length-prefixed frames
//! - Control message payloads exchanged between client and server
//! - Disconnect reason codes

#![forbid(unsafe_code)]

pub mod envelope;
pub mod message;
pub mod nonce;
pub mod reason;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of an X25519 public key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of a channel cookie in bytes.
pub const COOKIE_LENGTH: usize = 16;

/// Length of the cleartext envelope header, which doubles as the AEAD nonce.
pub const NONCE_LENGTH: usize = 24;

/// Maximum size of a single frame on the wire (header + payload).
pub const MAX_FRAME_SIZE: usize = 65_536;

/// A path key: the initiator's long-term public key.
pub type PathKey = [u8; KEY_LENGTH];

/// Wire protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("frame too large: {0} bytes, maximum {1}")]
    TooLarge(usize, usize),

    #[error("unknown disconnect reason: {0}")]
    UnknownReason(u16),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// An address within a path.
///
/// `0x00` is the server, `0x01` the initiator, `0x02..=0xff` responders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u8);

impl ClientId {
    /// The server's own address.
    pub const SERVER: ClientId = ClientId(0x00);
    /// The initiator slot of a path.
    pub const INITIATOR: ClientId = ClientId(0x01);
    /// First assignable responder id.
    pub const FIRST_RESPONDER: ClientId = ClientId(0x02);
    /// Last assignable responder id.
    pub const LAST_RESPONDER: ClientId = ClientId(0xff);

    pub fn is_server(self) -> bool {
        self.0 == 0x00
    }

    pub fn is_initiator(self) -> bool {
        self.0 == 0x01
    }

    pub fn is_responder(self) -> bool {
        self.0 >= 0x02
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl From<u8> for ClientId {
    fn from(value: u8) -> Self {
        ClientId(value)
    }
}

/// The two peer roles brokered by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}
