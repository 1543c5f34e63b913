//! Concurrent endpoint store with change notification
//!
//! # Atomicity Model
//!
//! Every mutation takes the registry mutex, changes the list and publishes
//! the resulting full snapshot before releasing it. Observers therefore only
//! ever see complete lists, in the same order the mutations happened.
//!
//! # Slow Observers
//!
//! Publishing happens inside the critical section, so it must never wait on
//! an observer. Snapshots go through a bounded broadcast ring of
//! [`DIRECTORY_BUFFER`] entries: sending never blocks, and an observer that
//! falls further behind loses its oldest pending snapshots (drop-oldest).
//! Since each snapshot is the full list, the next one it receives is
//! current again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use revish_core::SessionId;

use super::endpoint::Endpoint;

/// Snapshots retained per observer before the oldest is dropped
pub const DIRECTORY_BUFFER: usize = 16;

/// Immutable view of the registry at one instant, in insertion order
pub type Snapshot = Arc<[Endpoint]>;

/// Server-side store of live endpoints
pub struct SessionRegistry {
    /// Endpoints in insertion order
    endpoints: Mutex<Vec<Endpoint>>,
    /// Snapshot fan-out to observers
    updates: broadcast::Sender<Snapshot>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_buffer(DIRECTORY_BUFFER)
    }

    /// Create an empty registry with a custom per-observer buffer
    pub fn with_buffer(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            endpoints: Mutex::new(Vec::new()),
            updates,
        }
    }

    /// Append an endpoint and publish the new snapshot.
    ///
    /// Endpoints are not deduplicated: adding the same session twice yields
    /// two entries.
    pub fn add(&self, endpoint: Endpoint) {
        let mut endpoints = self.lock();
        tracing::debug!(
            "Adding endpoint {} ({}) for session {}",
            endpoint.hostname,
            endpoint.listening_address,
            endpoint.session_id.short()
        );
        endpoints.push(endpoint);
        self.publish(&endpoints);
    }

    /// Remove the first endpoint with the same session id.
    ///
    /// Publishes a snapshot whether or not anything matched. Returns true if
    /// an entry was removed.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut endpoints = self.lock();
        let position = endpoints.iter().position(|e| e.same_session(endpoint));
        if let Some(index) = position {
            let removed = endpoints.remove(index);
            tracing::debug!(
                "Removed endpoint {} for session {}",
                removed.hostname,
                removed.session_id.short()
            );
        } else {
            tracing::debug!(
                "No endpoint registered for session {}",
                endpoint.session_id.short()
            );
        }
        self.publish(&endpoints);
        position.is_some()
    }

    /// Remove every endpoint belonging to a closed connection.
    ///
    /// Publishes once, and only if something was removed. Returns the number
    /// of removed entries.
    pub fn purge_session(&self, session_id: &SessionId) -> usize {
        let mut endpoints = self.lock();
        let before = endpoints.len();
        endpoints.retain(|e| &e.session_id != session_id);
        let removed = before - endpoints.len();
        if removed > 0 {
            tracing::info!(
                "Reclaimed {} stale endpoint(s) for closed session {}",
                removed,
                session_id.short()
            );
            self.publish(&endpoints);
        }
        removed
    }

    /// Current endpoints in insertion order
    pub fn snapshot(&self) -> Snapshot {
        Arc::from(self.lock().as_slice())
    }

    /// Observe the registry.
    ///
    /// The subscription yields the current snapshot first, then every
    /// snapshot published afterwards.
    pub fn subscribe(&self) -> Subscription {
        // Hold the lock so no publish slips between the initial snapshot
        // and the receiver registration
        let endpoints = self.lock();
        Subscription {
            initial: Some(Arc::from(endpoints.as_slice())),
            updates: self.updates.subscribe(),
        }
    }

    /// Whether an endpoint from another session advertises `address`
    pub fn is_address_claimed(&self, address: &str, except: &SessionId) -> bool {
        self.lock()
            .iter()
            .any(|e| e.listening_address == address && &e.session_id != except)
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a snapshot to every observer without blocking
    fn publish(&self, endpoints: &[Endpoint]) {
        let snapshot: Snapshot = Arc::from(endpoints);
        match self.updates.send(snapshot) {
            Ok(observers) => {
                tracing::trace!(
                    "Published {} endpoint(s) to {} observer(s)",
                    endpoints.len(),
                    observers
                );
            }
            Err(_) => {
                tracing::trace!("Published {} endpoint(s) to no observers", endpoints.len());
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of registry snapshots for one observer
pub struct Subscription {
    /// Snapshot taken at subscription time, not yet delivered
    initial: Option<Snapshot>,
    /// Published snapshots
    updates: broadcast::Receiver<Snapshot>,
}

impl Subscription {
    /// Wait for the next snapshot.
    ///
    /// Returns `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.updates.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Directory observer lagged, dropped {} snapshot(s)", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next snapshot if one is already pending
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.updates.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Directory observer lagged, dropped {} snapshot(s)", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
