//! Core error types for revish

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while establishing, running or tearing down a tunnel.
///
/// Everything before the session is active is fatal for the client;
/// teardown failures are logged and never escalated.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Retries exhausted or a non-retryable rejection
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Reverse address reservation or availability probe failed
    #[error("Address negotiation failed: {0}")]
    Negotiation(String),

    /// Server did not acknowledge the registration
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Unregistration failed during shutdown
    #[error("Teardown failed: {0}")]
    Teardown(String),

    /// The underlying connection failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Graceful shutdown did not finish in time
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimedOut(Duration),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
