//! X25519 key material.
//!
//! The server holds one long-term **permanent keypair** (loaded once at
//! startup, immutable for the process lifetime) plus one fresh **session
//! keypair** per accepted connection. Session secrets are never persisted.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::CryptoError;
use shoal_core::KEY_LENGTH;

/// The server's long-term keypair.
///
/// Clients address a path by the initiator's public key and verify the
/// server's session key against this one via `signed_keys`.
pub struct PermanentKeypair {
    secret: StaticSecret,
}

impl PermanentKeypair {
    /// Generate a new keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw secret key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Load the keypair from a raw 32-byte secret key file.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let bytes = fs::read(path)?;
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} byte secret key, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }

        let mut key_bytes = [0u8; KEY_LENGTH];
        key_bytes.copy_from_slice(&bytes);
        let keypair = Self::from_bytes(key_bytes);
        key_bytes.zeroize();

        Ok(keypair)
    }

    /// Save the secret key, restricted to the owner on Unix.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        fs::write(path, self.secret.to_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Raw secret key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn secret_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LENGTH] {
        *self.public_key().as_bytes()
    }
}

/// A per-connection ephemeral keypair.
pub struct SessionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl SessionKeypair {
    /// Generate a fresh session keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LENGTH] {
        *self.public.as_bytes()
    }
}
