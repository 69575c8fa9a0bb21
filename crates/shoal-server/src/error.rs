//! Error taxonomy for the signaling core.
//!
//! Every fatal condition is local to one connection; the process and other
//! paths are unaffected. `PeerUnreachable` is the one non-fatal variant:
//! it is reported back to the sender as a `send-error` and the sender
//! survives.

use thiserror::Error;

use shoal_core::reason::DisconnectReason;
use shoal_core::{ClientId, WireError};
use shoal_crypto::validator::NonceViolation;
use shoal_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// Decryption or cookie-proof verification failed.
    #[error("authentication failure")]
    AuthFailure,

    /// Replay or reordering on an incoming channel.
    #[error("nonce violation: {0}")]
    Nonce(#[from] NonceViolation),

    /// Malformed or out-of-sequence message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No free responder slot on the path.
    #[error("no free responder slot on path")]
    PathFull,

    /// The addressed peer is absent. Non-fatal: reported to the sender.
    #[error("peer {0} unreachable")]
    PeerUnreachable(ClientId),

    /// The connection did not reach the relay phase in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The client stopped answering keep-alive probes.
    #[error("keep-alive timed out")]
    PingTimeout,

    /// The client asked for a permanent server key the server does not hold.
    #[error("server key mismatch")]
    InvalidKey,

    /// Outgoing combined sequence number space exhausted.
    #[error("combined sequence number space exhausted")]
    CsnExhausted,

    /// This connection was dropped on request of another (eviction or
    /// drop-responder).
    #[error("dropped: {0}")]
    Dropped(DisconnectReason),

    /// The transport stream closed.
    #[error("connection closed")]
    Disconnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// The reason code reported to the surviving peer.
    pub fn reason(&self) -> DisconnectReason {
        match self {
            Self::AuthFailure | Self::Nonce(_) | Self::Protocol(_) | Self::PeerUnreachable(_) => {
                DisconnectReason::ProtocolError
            }
            Self::PathFull => DisconnectReason::PathFull,
            Self::HandshakeTimeout | Self::PingTimeout => DisconnectReason::Timeout,
            Self::InvalidKey => DisconnectReason::InvalidKey,
            Self::Dropped(reason) => *reason,
            Self::Disconnected | Self::Io(_) => DisconnectReason::GoingAway,
            Self::CsnExhausted | Self::Internal(_) => DisconnectReason::InternalError,
        }
    }

    /// Whether the close was an ordinary departure rather than a fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Dropped(_))
    }
}

impl From<WireError> for SignalingError {
    fn from(err: WireError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<CryptoError> for SignalingError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthFailure => Self::AuthFailure,
            CryptoError::CsnExhausted => Self::CsnExhausted,
            CryptoError::Io(e) => Self::Io(e),
            other => Self::Internal(other.to_string()),
        }
    }
}
