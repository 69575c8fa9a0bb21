//! Disconnect reason codes.
//!
//! Carried in `disconnected` notifications to the surviving peer and logged
//! on the closing side. The `3xxx` range is signaling-specific; `1001` marks
//! an ordinary departure.

use crate::WireError;

/// Why a connection left its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DisconnectReason {
    /// Ordinary close: the client went away or the server is shutting down.
    GoingAway = 1001,
    /// No free responder slot on the path.
    PathFull = 3000,
    /// Malformed, out-of-sequence, or otherwise invalid traffic; includes
    /// authentication and nonce failures.
    ProtocolError = 3001,
    /// Server-side failure unrelated to the client's behavior.
    InternalError = 3002,
    /// A newer initiator claimed the path and evicted this connection.
    InitiatorReplaced = 3003,
    /// The initiator requested this responder be dropped.
    DroppedByInitiator = 3004,
    /// The client asked for a permanent server key the server does not hold.
    InvalidKey = 3007,
    /// Handshake or keep-alive deadline exceeded.
    Timeout = 3008,
}

impl DisconnectReason {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1001 => Ok(Self::GoingAway),
            3000 => Ok(Self::PathFull),
            3001 => Ok(Self::ProtocolError),
            3002 => Ok(Self::InternalError),
            3003 => Ok(Self::InitiatorReplaced),
            3004 => Ok(Self::DroppedByInitiator),
            3007 => Ok(Self::InvalidKey),
            3008 => Ok(Self::Timeout),
            _ => Err(WireError::UnknownReason(value)),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GoingAway => "going-away",
            Self::PathFull => "path-full",
            Self::ProtocolError => "protocol-error",
            Self::InternalError => "internal-error",
            Self::InitiatorReplaced => "initiator-replaced",
            Self::DroppedByInitiator => "dropped-by-initiator",
            Self::InvalidKey => "invalid-key",
            Self::Timeout => "timeout",
        };
        write!(f, "{} ({})", name, self.code())
    }
}
