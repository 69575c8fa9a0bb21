//! Public-key authenticated encryption (the box construction).
//!
//! A box binds one party's secret key to the other's public key: the X25519
//! shared secret is expanded through HKDF-SHA256 into an XChaCha20-Poly1305
//! key, and every payload is sealed with the 24-byte envelope header as the
//! explicit nonce. Integrity and authenticity are verified atomically with
//! decryption; tampering surfaces as [`CryptoError::AuthFailure`], never as
//! partial plaintext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::CryptoError;
use shoal_core::NONCE_LENGTH;

/// HKDF salt for domain separation.
const HKDF_SALT: &[u8] = b"shoal-box-hkdf-salt-v1";

/// HKDF info string for box key derivation.
const HKDF_INFO: &[u8] = b"shoal-box-key-v1";

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LENGTH: usize = 16;

/// An authenticated-encryption box between two X25519 keys.
///
/// Both directions of a channel share one box: the shared secret is
/// symmetric, and nonce uniqueness is guaranteed by the per-sender cookie
/// and combined sequence number in the envelope header.
pub struct CryptoBox {
    cipher: XChaCha20Poly1305,
}

impl CryptoBox {
    /// Derive a box from our secret key and the remote public key.
    pub fn new(secret: &StaticSecret, remote: &PublicKey) -> Result<Self, CryptoError> {
        let shared = secret.diffie_hellman(remote);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("low-order remote key".into()));
        }

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.as_bytes());
        let mut key_bytes = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key_bytes)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        key_bytes.zeroize();

        Ok(Self { cipher })
    }

    /// Seal a plaintext under the given envelope header.
    pub fn seal(&self, nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::AuthFailure)
    }

    /// Open a ciphertext sealed under the given envelope header.
    pub fn open(&self, nonce: &[u8; NONCE_LENGTH], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthFailure)
    }
}
