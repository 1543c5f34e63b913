//! Session registry: the live directory of reachable clients

mod endpoint;
mod store;

pub use endpoint::{DirectoryEntry, Endpoint};
pub use store::{SessionRegistry, Snapshot, Subscription, DIRECTORY_BUFFER};
