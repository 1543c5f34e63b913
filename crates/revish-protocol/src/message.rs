//! Registration message carried by every probe

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Largest encoded probe payload accepted, in hex characters
pub const MAX_PROBE_PAYLOAD: usize = 4096;

/// Render a reverse listening address as `host:port`.
///
/// IPv6 hosts are bracketed so the result parses as a socket address. Both
/// ends use this form, which makes it usable as a lookup key.
pub fn listen_address(host: &str, port: u32) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Self-reported metadata a client attaches to its probes.
///
/// Carries no session identity: the server derives identity from the
/// connection the probe arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    /// Account the client process runs as
    pub current_user: String,
    /// Host name of the client machine
    pub hostname: String,
    /// Server-side address tunnelling back to the client
    pub listening_address: String,
}

impl RegistrationMessage {
    /// Create a new registration message
    pub fn new(
        current_user: impl Into<String>,
        hostname: impl Into<String>,
        listening_address: impl Into<String>,
    ) -> Self {
        Self {
            current_user: current_user.into(),
            hostname: hostname.into(),
            listening_address: listening_address.into(),
        }
    }

    /// Encode for the `originator_address` field of a probe open
    pub fn to_probe_payload(&self) -> Result<String, ProtocolError> {
        let raw = bincode::serialize(self)?;
        let encoded = hex::encode(raw);
        if encoded.len() > MAX_PROBE_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: encoded.len(),
                max: MAX_PROBE_PAYLOAD,
            });
        }
        Ok(encoded)
    }

    /// Decode from the `originator_address` field of a probe open
    pub fn from_probe_payload(payload: &str) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PROBE_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PROBE_PAYLOAD,
            });
        }
        let raw = hex::decode(payload)?;
        Ok(bincode::deserialize(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_address_format() {
        assert_eq!(listen_address("127.0.0.1", 40000), "127.0.0.1:40000");
        assert_eq!(listen_address("::1", 40000), "[::1]:40000");
        assert_eq!(listen_address("localhost", 22), "localhost:22");
    }

    #[test]
    fn test_payload_roundtrip() {
        let message = RegistrationMessage::new("alice", "alicebox", "10.0.0.5:9000");
        let payload = message.to_probe_payload().unwrap();

        assert!(payload.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            RegistrationMessage::from_probe_payload(&payload).unwrap(),
            message
        );
    }

    #[test]
    fn test_reject_non_hex_payload() {
        let result = RegistrationMessage::from_probe_payload("127.0.0.1");
        assert!(matches!(result, Err(ProtocolError::Encoding(_))));
    }

    #[test]
    fn test_reject_truncated_payload() {
        let message = RegistrationMessage::new("alice", "alicebox", "10.0.0.5:9000");
        let payload = message.to_probe_payload().unwrap();

        let result = RegistrationMessage::from_probe_payload(&payload[..payload.len() - 8]);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_reject_oversized_payload() {
        let message = RegistrationMessage::new("a".repeat(MAX_PROBE_PAYLOAD), "box", "addr");
        assert!(matches!(
            message.to_probe_payload(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
