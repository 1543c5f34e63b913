//! Control-channel probe handlers
//!
//! Clients signal the server by opening probe channels (see
//! [`revish_protocol::probe`]). The [`ProbeRouter`] maps each probe kind to
//! a [`ProbeHandler`] that decodes the attached registration message, acts
//! on the session registry and answers with a [`ProbeStatus`]. A kind
//! without a handler is reported as unsupported so the caller can tell it
//! apart from an explicit answer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use revish_core::SessionId;
use revish_protocol::{ProbeKind, ProbeStatus, RegistrationMessage};

use crate::forward::ForwardTable;
use crate::registry::{Endpoint, SessionRegistry};

/// The connection a probe arrived on
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Identity of the transport connection
    pub session_id: SessionId,
    /// Address the client connected from
    pub remote_addr: SocketAddr,
}

/// Server-side handler for one probe kind
pub trait ProbeHandler: Send + Sync {
    /// Act on a probe and choose the status to answer with.
    ///
    /// `payload` is the raw hex payload from the channel-open request.
    fn handle(&self, ctx: &ProbeContext, payload: &str) -> ProbeStatus;
}

/// Dispatches probe opens to their handlers
#[derive(Default, Clone)]
pub struct ProbeRouter {
    handlers: HashMap<ProbeKind, Arc<dyn ProbeHandler>>,
}

impl ProbeRouter {
    /// Create a router with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the register, unregister and address-availability handlers
    pub fn standard(registry: Arc<SessionRegistry>, forwards: Arc<ForwardTable>) -> Self {
        let mut router = Self::new();
        router
            .on_signal(
                ProbeKind::RequestRemotePort,
                PortAvailabilityHandler::new(Arc::clone(&registry), forwards),
            )
            .on_signal(
                ProbeKind::RegisterSession,
                RegisterHandler::new(Arc::clone(&registry)),
            )
            .on_signal(ProbeKind::UnregisterSession, UnregisterHandler::new(registry));
        router
    }

    /// Install the handler for a probe kind, replacing any previous one
    pub fn on_signal<H>(&mut self, kind: ProbeKind, handler: H) -> &mut Self
    where
        H: ProbeHandler + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Run the handler for a probe named `kind`.
    ///
    /// Returns `None` when the name is unknown or no handler is installed;
    /// the channel-open must then be refused.
    pub fn dispatch(&self, kind: &str, ctx: &ProbeContext, payload: &str) -> Option<ProbeStatus> {
        let kind: ProbeKind = match kind.parse() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!("Probe from {} refused: {}", ctx.remote_addr, e);
                return None;
            }
        };
        let Some(handler) = self.handlers.get(&kind) else {
            tracing::debug!("No handler for {} probe from {}", kind, ctx.remote_addr);
            return None;
        };
        let status = handler.handle(ctx, payload);
        tracing::debug!(
            "{} probe from {} answered {}",
            kind,
            ctx.remote_addr,
            status
        );
        Some(status)
    }
}

fn decode(kind: ProbeKind, ctx: &ProbeContext, payload: &str) -> Option<RegistrationMessage> {
    match RegistrationMessage::from_probe_payload(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(
                "Could not parse {} payload from {}: {}",
                kind,
                ctx.remote_addr,
                e
            );
            None
        }
    }
}

/// Adds the announcing session to the registry
pub struct RegisterHandler {
    registry: Arc<SessionRegistry>,
}

impl RegisterHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl ProbeHandler for RegisterHandler {
    fn handle(&self, ctx: &ProbeContext, payload: &str) -> ProbeStatus {
        let Some(message) = decode(ProbeKind::RegisterSession, ctx, payload) else {
            return ProbeStatus::Malformed;
        };

        tracing::info!(
            "New remote session from {}: {} on {} reachable via {}",
            ctx.remote_addr,
            message.current_user,
            message.hostname,
            message.listening_address
        );

        self.registry.add(Endpoint::from_registration(
            ctx.session_id.clone(),
            ctx.remote_addr,
            message,
        ));
        ProbeStatus::Registered
    }
}

/// Removes the retracting session from the registry
pub struct UnregisterHandler {
    registry: Arc<SessionRegistry>,
}

impl UnregisterHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl ProbeHandler for UnregisterHandler {
    fn handle(&self, ctx: &ProbeContext, payload: &str) -> ProbeStatus {
        let Some(message) = decode(ProbeKind::UnregisterSession, ctx, payload) else {
            return ProbeStatus::Malformed;
        };

        tracing::info!(
            "Closing remote session from {}: {} on {} reachable via {}",
            ctx.remote_addr,
            message.current_user,
            message.hostname,
            message.listening_address
        );

        // Matching is by session id only; the metadata just fills the key
        self.registry.remove(&Endpoint::from_registration(
            ctx.session_id.clone(),
            ctx.remote_addr,
            message,
        ));
        ProbeStatus::Unregistered
    }
}

/// Answers whether a negotiated listening address may be used.
///
/// The address is available when the asking connection holds the reverse
/// forward for it and no other live endpoint already advertises it.
pub struct PortAvailabilityHandler {
    registry: Arc<SessionRegistry>,
    forwards: Arc<ForwardTable>,
}

impl PortAvailabilityHandler {
    pub fn new(registry: Arc<SessionRegistry>, forwards: Arc<ForwardTable>) -> Self {
        Self { registry, forwards }
    }
}

impl ProbeHandler for PortAvailabilityHandler {
    fn handle(&self, ctx: &ProbeContext, payload: &str) -> ProbeStatus {
        let Some(message) = decode(ProbeKind::RequestRemotePort, ctx, payload) else {
            return ProbeStatus::Malformed;
        };
        let address = message.listening_address.as_str();

        if !self.forwards.is_held_by(address, &ctx.session_id) {
            tracing::info!(
                "{} asked for {} without holding its forward",
                ctx.remote_addr,
                address
            );
            return ProbeStatus::Taken;
        }
        if self.registry.is_address_claimed(address, &ctx.session_id) {
            tracing::info!(
                "{} asked for {} which another session advertises",
                ctx.remote_addr,
                address
            );
            return ProbeStatus::Taken;
        }

        ProbeStatus::Available
    }
}
