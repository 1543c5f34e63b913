//! Policy gates consulted by the connection handler
//!
//! Two seams decide what an authenticated party may do:
//!
//! - [`ForwardGate`] authorizes reverse listening addresses (`tcpip-forward`)
//! - [`SessionGate`] authorizes interactive use of the server itself: shells,
//!   command execution, subsystems, PTYs and local port-forwards
//!
//! Probe channels are not interactive sessions and never pass through either
//! gate.

use std::fmt;
use std::net::SocketAddr;

/// Who is asking
#[derive(Debug, Clone)]
pub struct GateContext {
    /// Authenticated user name
    pub user: String,
    /// Address the request came from
    pub remote_addr: SocketAddr,
}

/// Kinds of interactive request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    /// Interactive shell
    Shell,
    /// Command execution
    Exec,
    /// Named subsystem such as `sftp`
    Subsystem,
    /// Pseudo-terminal allocation
    Pty,
    /// Local port-forward (`direct-tcpip` to a real target)
    LocalForward,
}

impl fmt::Display for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionRequest::Shell => "shell",
            SessionRequest::Exec => "exec",
            SessionRequest::Subsystem => "subsystem",
            SessionRequest::Pty => "pty-req",
            SessionRequest::LocalForward => "direct-tcpip",
        };
        f.write_str(name)
    }
}

/// Decides whether a connected client may bind a reverse listening address
pub trait ForwardGate: Send + Sync {
    fn authorize(&self, ctx: &GateContext, host: &str, port: u32) -> bool;
}

/// Decides whether an interactive request is allowed
pub trait SessionGate: Send + Sync {
    fn authorize(&self, ctx: &GateContext, request: SessionRequest) -> bool;
}

/// Grants every reverse-forward request and logs the grant
#[derive(Debug, Default, Clone, Copy)]
pub struct GrantAllForwards;

impl ForwardGate for GrantAllForwards {
    fn authorize(&self, ctx: &GateContext, host: &str, port: u32) -> bool {
        tracing::info!(
            "Attempt by {}@{} to bind at {}:{} granted",
            ctx.user,
            ctx.remote_addr,
            host,
            port
        );
        true
    }
}

/// Denies every interactive request when the server runs in no-shell mode
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShell {
    forbidden: bool,
}

impl NoShell {
    pub fn new(forbidden: bool) -> Self {
        Self { forbidden }
    }
}

impl SessionGate for NoShell {
    fn authorize(&self, ctx: &GateContext, request: SessionRequest) -> bool {
        if self.forbidden {
            tracing::info!(
                "Denied {} request from {}@{}",
                request,
                ctx.user,
                ctx.remote_addr
            );
            return false;
        }
        true
    }
}
