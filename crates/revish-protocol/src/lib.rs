//! revish-protocol: Control-channel protocol for revish
//!
//! Defines the one-shot probe signals a client sends to the server after
//! authenticating (claim an address, announce itself, retract itself), the
//! registration payload they carry, and the framed status reply the server
//! answers with.

pub mod codec;
pub mod error;
pub mod message;
pub mod probe;

pub use codec::{ProbeReply, ReplyCodec, REPLY_HEADER_SIZE};
pub use error::ProtocolError;
pub use message::{listen_address, RegistrationMessage};
pub use probe::{ProbeKind, ProbeOutcome, ProbeStatus, PROBE_PORT};
