//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding control traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Reply frame announced an unsupported version
    #[error("Unsupported reply version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Probe payload was not valid hex
    #[error("Invalid probe payload encoding: {0}")]
    Encoding(#[from] hex::FromHexError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
