//! revish-client: The dialing side of a revish tunnel
//!
//! The client runs on a machine without inbound connectivity. It dials the
//! rendezvous server with the service account, claims a reverse listening
//! address, announces itself and then serves operator shells for every
//! connection that arrives back through the tunnel.

pub mod registration;
pub mod shell;
pub mod state;
pub mod tunnel;

pub use registration::{ActiveTunnel, TunnelClient, TunnelSettings};
pub use state::Phase;
