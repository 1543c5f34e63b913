//! Endpoint records

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use revish_core::SessionId;
use revish_protocol::RegistrationMessage;

/// One reachable reverse-tunneled client session
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Transport connection the registration arrived on
    pub session_id: SessionId,
    /// Address the client connected from
    pub remote_addr: SocketAddr,
    /// Self-reported user
    pub user: String,
    /// Self-reported host name
    pub hostname: String,
    /// Server-side address tunnelling back to the client
    pub listening_address: String,
}

impl Endpoint {
    /// Build an endpoint from a connection and its registration payload
    pub fn from_registration(
        session_id: SessionId,
        remote_addr: SocketAddr,
        message: RegistrationMessage,
    ) -> Self {
        Self {
            session_id,
            remote_addr,
            user: message.current_user,
            hostname: message.hostname,
            listening_address: message.listening_address,
        }
    }

    /// Whether both records describe the same session.
    ///
    /// Only the session id is compared.
    pub fn same_session(&self, other: &Endpoint) -> bool {
        self.session_id == other.session_id
    }

    /// Directory view of this endpoint
    pub fn directory_entry(&self, proxy_user: &str) -> DirectoryEntry {
        DirectoryEntry {
            listening_address: self.listening_address.clone(),
            display_name: self.hostname.clone(),
            proxy_user: proxy_user.to_string(),
        }
    }
}

/// What a directory renderer needs to show one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Address to connect to
    pub listening_address: String,
    /// Human-readable name
    pub display_name: String,
    /// User to log in as
    pub proxy_user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: u8, host: &str) -> Endpoint {
        Endpoint::from_registration(
            SessionId::new(vec![id]),
            "10.0.0.5:50000".parse().unwrap(),
            RegistrationMessage::new("alice", host, "127.0.0.1:9000"),
        )
    }

    #[test]
    fn test_same_session_ignores_metadata() {
        assert!(endpoint(1, "alicebox").same_session(&endpoint(1, "otherbox")));
        assert!(!endpoint(1, "alicebox").same_session(&endpoint(2, "alicebox")));
    }

    #[test]
    fn test_directory_entry() {
        let entry = endpoint(1, "alicebox").directory_entry("operator");
        assert_eq!(entry.listening_address, "127.0.0.1:9000");
        assert_eq!(entry.display_name, "alicebox");
        assert_eq!(entry.proxy_user, "operator");
    }
}
