//! Service identity credentials
//!
//! Clients dial home with a dedicated, unprivileged service account that is
//! never used for operator access. Both ends take the credential through an
//! injectable abstraction instead of a compiled-in literal:
//!
//! - [`CredentialProvider`] supplies the client's credential and asks for a
//!   replacement password after a rejection
//! - [`PasswordValidator`] decides on the server whether a password attempt
//!   matches the provisioned service identity

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ConfigError;

/// Default name of the service account
pub const DEFAULT_SERVICE_USER: &str = "revish";

/// Errors from credential prompts
#[derive(Error, Debug)]
pub enum CredentialError {
    /// No way to ask anyone for a password
    #[error("No interactive terminal available to prompt for a password")]
    NonInteractive,

    /// The prompt itself failed
    #[error("Password prompt failed: {0}")]
    Prompt(String),
}

/// A user/password pair for the service account
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    /// Account name
    pub user: String,
    /// Account password
    pub password: String,
}

impl ServiceCredentials {
    /// Create a credential pair
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of the client's service credential
pub trait CredentialProvider: Send + Sync {
    /// Credential to try first
    fn initial(&self) -> ServiceCredentials;

    /// Ask for a replacement password after the server rejected one
    fn prompt_password(&self, user: &str) -> Result<String, CredentialError>;
}

/// Credential fixed at startup, with no interactive fallback
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: ServiceCredentials,
}

impl StaticCredentials {
    /// Wrap a fixed credential
    pub fn new(credentials: ServiceCredentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentials {
    fn initial(&self) -> ServiceCredentials {
        self.credentials.clone()
    }

    fn prompt_password(&self, _user: &str) -> Result<String, CredentialError> {
        Err(CredentialError::NonInteractive)
    }
}

/// Server-side check of service account password attempts
pub trait PasswordValidator: Send + Sync {
    /// Whether `password` is valid for `user`
    fn validate(&self, user: &str, password: &str) -> bool;
}

/// A single provisioned account whose password is held only as a digest
#[derive(Clone)]
pub struct SharedSecret {
    user: String,
    digest: [u8; 32],
}

impl SharedSecret {
    /// Provision from a plain-text password
    pub fn from_password(user: impl Into<String>, password: &str) -> Self {
        Self {
            user: user.into(),
            digest: sha256(password),
        }
    }

    /// Provision from a hex-encoded SHA-256 digest of the password
    pub fn from_hex_digest(user: impl Into<String>, digest: &str) -> Result<Self, ConfigError> {
        let raw = hex::decode(digest.trim())
            .map_err(|e| ConfigError::Invalid(format!("service password digest: {}", e)))?;
        let digest: [u8; 32] = raw.try_into().map_err(|_| {
            ConfigError::Invalid("service password digest must be 32 bytes".to_string())
        })?;
        Ok(Self {
            user: user.into(),
            digest,
        })
    }

    /// Account name this secret belongs to
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl PasswordValidator for SharedSecret {
    fn validate(&self, user: &str, password: &str) -> bool {
        let attempt = sha256(password);
        // Compare every byte so timing does not depend on the mismatch position
        let diff = attempt
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        user == self.user && diff == 0
    }
}

fn sha256(input: &str) -> [u8; 32] {
    Sha256::digest(input.as_bytes()).into()
}
