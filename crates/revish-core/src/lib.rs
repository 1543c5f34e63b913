//! revish-core: Core abstractions and configuration for revish
//!
//! This crate provides shared types, error taxonomy, configuration
//! structures, credential handling and key management used by the server,
//! the client and the CLI.

pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod types;

pub use error::{ConfigError, TunnelError};
pub use types::{HostIdentity, SessionId};
