//! Core domain types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of generated session identifiers in bytes
pub const SESSION_ID_LEN: usize = 16;

/// Value reported when a host identity lookup fails
pub const UNKNOWN_IDENTITY: &str = "ERROR";

/// Opaque identifier of one transport connection.
///
/// Equality is byte-exact; two sessions with identical metadata are still
/// distinct.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    /// Wrap raw identifier bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(rand::random::<[u8; SESSION_ID_LEN]>().to_vec())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Shortened hex form for log lines
    pub fn short(&self) -> String {
        let full = hex::encode(&self.0);
        full.chars().take(12).collect()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

impl From<&[u8]> for SessionId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Who the client says it is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Account the client process runs as
    pub current_user: String,
    /// Host name of the client machine
    pub hostname: String,
}

impl HostIdentity {
    /// Create an identity from explicit values
    pub fn new(current_user: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            current_user: current_user.into(),
            hostname: hostname.into(),
        }
    }

    /// Look up the current user and host name
    pub fn detect() -> Self {
        let current_user = non_empty(whoami::username());
        let hostname = non_empty(gethostname::gethostname().to_string_lossy().into_owned());
        Self {
            current_user,
            hostname,
        }
    }
}

fn non_empty(value: String) -> String {
    if value.trim().is_empty() {
        UNKNOWN_IDENTITY.to_string()
    } else {
        value
    }
}
