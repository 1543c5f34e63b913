//! Transport seams used by the registration state machine
//!
//! The state machine only needs four things from the secure transport: dial
//! and authenticate, reserve a reverse listening address, send probes, and
//! close. They are expressed as traits so the sequence can be driven by the
//! russh implementation in [`connector`] or by scripted fakes.

pub mod connector;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use revish_core::credentials::ServiceCredentials;
use revish_protocol::{ProbeKind, ProbeOutcome, ProtocolError, RegistrationMessage};

pub use connector::{SshConnection, SshDialer, SshForwardListener};

/// Errors from dialing the server
#[derive(Debug, Error)]
pub enum DialError {
    /// The server rejected the service credentials
    #[error("Authentication rejected by server")]
    AuthRejected,

    /// The server's host key did not match the configured fingerprint
    #[error("Host key verification failed: {0}")]
    HostKeyRejected(String),

    /// Any other connection error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Probe failures other than an answered or unsupported probe
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Payload could not be encoded or the reply could not be decoded
    #[error("Probe protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection failed while the probe was in flight
    #[error("Probe transport failed: {0}")]
    Transport(String),

    /// The channel closed before a complete reply arrived
    #[error("Probe channel closed without a reply")]
    Truncated,
}

/// Opens authenticated connections to the server
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: ControlConnection;

    /// Connect and authenticate with `credentials`.
    ///
    /// A rejected credential is reported as [`DialError::AuthRejected`] so
    /// the caller may retry with another one.
    async fn dial(&self, credentials: &ServiceCredentials) -> Result<Self::Conn, DialError>;
}

/// An authenticated connection to the server
#[async_trait]
pub trait ControlConnection: Send + Sync {
    type Listener: ForwardListener;

    /// Ask the server to listen on `host:port` and tunnel connections back
    async fn request_reverse_listen(
        &mut self,
        host: &str,
        port: u32,
    ) -> anyhow::Result<Self::Listener>;

    /// Send a one-shot probe and wait for the server's answer
    async fn open_probe(
        &self,
        kind: ProbeKind,
        message: &RegistrationMessage,
    ) -> Result<ProbeOutcome, ProbeError>;

    /// Close the connection
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Connections arriving through the reverse listening address
#[async_trait]
pub trait ForwardListener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Server-side address (`host:port`) this listener is reachable at
    fn local_address(&self) -> &str;

    /// Wait for the next forwarded connection.
    ///
    /// Returns `None` once the listener is released or the connection is
    /// gone.
    async fn accept(&mut self) -> Option<Self::Stream>;

    /// Release the listening address. Calling it again is a no-op.
    async fn close(&mut self) -> anyhow::Result<()>;
}
