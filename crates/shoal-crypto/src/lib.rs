//! Cryptographic primitives for the Shoal signaling relay.
//!
//! This crate provides:
//! - Long-term and per-connection X25519 keypairs
//! - The box construction used for every sealed payload
//! - Outgoing combined sequence numbers
//! - Per-channel incoming nonce validation

#![forbid(unsafe_code)]

pub mod boxes;
pub mod csn;
pub mod identity;
pub mod validator;

use thiserror::Error;

/// Crypto operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Decryption or authentication failed. Intentionally carries no
    /// detail: the caller must not learn why a payload was rejected.
    #[error("authentication failure")]
    AuthFailure,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("combined sequence number space exhausted")]
    CsnExhausted,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
