//! Probe channel kinds and their typed outcomes
//!
//! A probe is a channel-open used purely as a one-shot signal: the caller
//! attaches a small payload to the open request, the remote side acts on it
//! and answers with a [`ProbeStatus`]. The channel is never promoted to a
//! data stream.
//!
//! # Wire Binding
//!
//! Probes ride on `direct-tcpip` opens:
//!
//! - `host_to_connect` carries the [`ProbeKind`] name
//! - `port_to_connect` is [`PROBE_PORT`]
//! - `originator_address` carries the hex-encoded payload
//!
//! A refused open means the remote has no handler for that kind
//! ([`ProbeOutcome::Unsupported`]). A handled probe is answered with a single
//! reply frame (see [`crate::codec`]) before the remote closes the channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Destination port marking a `direct-tcpip` open as a probe.
///
/// Port 0 is never a valid connect target, so it cannot collide with a real
/// local port-forward request.
pub const PROBE_PORT: u32 = 0;

/// The control signals a client can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Ask whether a negotiated listening address may be used
    RequestRemotePort,
    /// Announce a reachable session
    RegisterSession,
    /// Retract a previously announced session
    UnregisterSession,
}

impl ProbeKind {
    /// All probe kinds, in handshake order
    pub const ALL: [ProbeKind; 3] = [
        ProbeKind::RequestRemotePort,
        ProbeKind::RegisterSession,
        ProbeKind::UnregisterSession,
    ];

    /// Channel kind name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::RequestRemotePort => "request-remote-port",
            ProbeKind::RegisterSession => "register-session",
            ProbeKind::UnregisterSession => "unregister-session",
        }
    }

    /// The status a well-behaved server answers with on success
    pub fn success_status(&self) -> ProbeStatus {
        match self {
            ProbeKind::RequestRemotePort => ProbeStatus::Available,
            ProbeKind::RegisterSession => ProbeStatus::Registered,
            ProbeKind::UnregisterSession => ProbeStatus::Unregistered,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown probe kind: {}", s))
    }
}

/// Status code a probe handler answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProbeStatus {
    /// The requested listening address may be used
    Available = 0x01,
    /// The requested listening address is held by someone else
    Taken = 0x02,
    /// The session was added to the directory
    Registered = 0x03,
    /// The session was removed from the directory
    Unregistered = 0x04,
    /// The payload could not be decoded; nothing was changed
    Malformed = 0xFE,
}

impl ProbeStatus {
    /// Stable name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Available => "port_available",
            ProbeStatus::Taken => "port_taken",
            ProbeStatus::Registered => "registered_remote_session",
            ProbeStatus::Unregistered => "unregistered_remote_session",
            ProbeStatus::Malformed => "malformed_payload",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed probe round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The remote declined to open a stream and answered with a status
    Rejected(ProbeStatus),
    /// The remote has no handler registered for this probe kind
    Unsupported,
}

impl ProbeOutcome {
    /// Whether the outcome is exactly the expected status
    pub fn is(&self, expected: ProbeStatus) -> bool {
        matches!(self, ProbeOutcome::Rejected(status) if *status == expected)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Rejected(status) => write!(f, "rejected ({})", status),
            ProbeOutcome::Unsupported => f.write_str("unsupported channel type"),
        }
    }
}
