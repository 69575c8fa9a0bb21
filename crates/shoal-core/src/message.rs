//! Control message payloads exchanged between client and server.
//!
//! Payloads are JSON objects tagged by a `type` field. Binary fields (keys,
//! cookies, message ids) travel as lowercase hex strings. Relayed
//! client-to-client payloads never pass through these types — the server
//! forwards them as opaque bytes.

use serde::{Deserialize, Serialize};

use crate::{Role, WireError, COOKIE_LENGTH, KEY_LENGTH};

/// Hex-string (de)serialization for fixed-size byte arrays.
pub mod hex_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(value: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {} hex-encoded bytes", N)))
    }
}

/// Hex-string (de)serialization for variable-length byte vectors.
pub mod hex_vec {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(D::Error::custom)
    }
}

/// A control message between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Server greeting: the server's fresh session public key. Plaintext.
    ServerHello {
        #[serde(with = "hex_array")]
        key: [u8; KEY_LENGTH],
    },

    /// Client greeting: the client's long-term public key, the path it wants
    /// to join, and its declared role. Plaintext. Initiators may omit `path`
    /// (their own key is the path key).
    ClientHello {
        #[serde(with = "hex_array")]
        key: [u8; KEY_LENGTH],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<HexKey>,
        role: Role,
    },

    /// Client authentication, sealed to the server's session key: proof of
    /// the server cookie, the client's session public key, and optional
    /// expectations about the server's permanent key and keep-alive cadence.
    ClientAuth {
        #[serde(with = "hex_array")]
        your_cookie: [u8; COOKIE_LENGTH],
        #[serde(with = "hex_array")]
        session_key: [u8; KEY_LENGTH],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        your_key: Option<HexKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping_interval: Option<u32>,
    },

    /// Server authentication, sealed: echoes the client cookie, proves the
    /// session key under the permanent key, and describes the path. The
    /// assigned client-id travels in the envelope destination.
    ServerAuth {
        #[serde(with = "hex_array")]
        your_cookie: [u8; COOKIE_LENGTH],
        #[serde(with = "hex_vec")]
        signed_keys: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator_connected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responders: Option<Vec<u8>>,
    },

    /// An initiator arrived on the path (sent to each responder).
    NewInitiator,

    /// A responder arrived on the path (sent to the initiator).
    NewResponder { id: u8 },

    /// Initiator request to disconnect a responder.
    DropResponder {
        id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<u16>,
    },

    /// A relay attempt failed; `id` names the failed envelope.
    SendError {
        #[serde(with = "hex_array")]
        id: [u8; 8],
    },

    /// A peer left the path.
    Disconnected { id: u8, reason: u16 },

    /// Keep-alive probe.
    Ping,

    /// Keep-alive response.
    Pong,
}

/// A hex-encoded public key inside optional message fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexKey(#[serde(with = "hex_array")] pub [u8; KEY_LENGTH]);

impl ControlMessage {
    /// Serialize to the wire payload.
    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("control message serialization cannot fail")
    }

    /// Parse a wire payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// The message type name, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ServerHello { .. } => "server-hello",
            ControlMessage::ClientHello { .. } => "client-hello",
            ControlMessage::ClientAuth { .. } => "client-auth",
            ControlMessage::ServerAuth { .. } => "server-auth",
            ControlMessage::NewInitiator => "new-initiator",
            ControlMessage::NewResponder { .. } => "new-responder",
            ControlMessage::DropResponder { .. } => "drop-responder",
            ControlMessage::SendError { .. } => "send-error",
            ControlMessage::Disconnected { .. } => "disconnected",
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        let msg = ControlMessage::ServerHello { key: [0xab; 32] };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "server-hello");
        assert_eq!(json["key"], hex::encode([0xab; 32]));
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let msg = ControlMessage::ClientHello {
            key: [0x01; 32],
            path: Some(HexKey([0x02; 32])),
            role: Role::Responder,
        };
        let parsed = ControlMessage::from_slice(&msg.to_vec()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let msg = ControlMessage::ClientAuth {
            your_cookie: [0x03; 16],
            session_key: [0x04; 32],
            your_key: None,
            ping_interval: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("your_key"));
        assert!(!json.contains("ping_interval"));

        let parsed = ControlMessage::from_slice(json.as_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unit_variants() {
        let parsed = ControlMessage::from_slice(br#"{"type":"new-initiator"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::NewInitiator);
        assert_eq!(ControlMessage::Ping.to_vec(), br#"{"type":"ping"}"#.to_vec());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(ControlMessage::from_slice(b"not json").is_err());
        assert!(ControlMessage::from_slice(br#"{"type":"no-such-type"}"#).is_err());
        // Wrong hex length
        assert!(ControlMessage::from_slice(br#"{"type":"server-hello","key":"abcd"}"#).is_err());
    }
}
