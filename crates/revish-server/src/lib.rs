//! revish-server: Rendezvous server for reverse SSH tunnels
//!
//! Clients without inbound connectivity dial in, reserve a reverse listening
//! address and announce themselves over probe channels. The server keeps a
//! live directory of reachable sessions and notifies observers whenever it
//! changes.

pub mod control;
pub mod directory;
pub mod forward;
pub mod policy;
pub mod registry;
pub mod server;
pub mod state;

pub use control::{ProbeContext, ProbeHandler, ProbeRouter};
pub use registry::{DirectoryEntry, Endpoint, SessionRegistry, Snapshot, Subscription};
pub use server::SshServer;
pub use state::ServerState;
