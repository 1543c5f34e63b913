//! Shared server state

use std::sync::Arc;

use anyhow::Result;

use revish_core::config::ServerConfig;
use revish_core::credentials::PasswordValidator;
use revish_core::keys::AuthorizedKeys;

use crate::control::ProbeRouter;
use crate::forward::ForwardTable;
use crate::policy::{ForwardGate, GrantAllForwards, NoShell, SessionGate};
use crate::registry::SessionRegistry;

/// State shared by every connection handler
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Live endpoints
    pub registry: Arc<SessionRegistry>,
    /// Bound reverse listening addresses
    pub forwards: Arc<ForwardTable>,
    /// Probe handlers
    pub probes: ProbeRouter,
    /// Service account password check
    pub validator: Arc<dyn PasswordValidator>,
    /// Operator public keys
    pub operator_keys: Arc<AuthorizedKeys>,
    /// Reverse-forward authorization
    pub forward_gate: Arc<dyn ForwardGate>,
    /// Interactive-session authorization
    pub session_gate: Arc<dyn SessionGate>,
}

impl ServerState {
    /// Build the standard state from configuration.
    ///
    /// Fails when no service password is provisioned.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let validator = Arc::new(config.service_secret()?);
        let operator_keys = AuthorizedKeys::load_or_empty(&config.operator_keys_path)?;
        Ok(Self::new(config, validator, operator_keys))
    }

    /// Build the standard state with an explicit validator and operator keys
    pub fn new(
        config: ServerConfig,
        validator: Arc<dyn PasswordValidator>,
        operator_keys: AuthorizedKeys,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let forwards = Arc::new(ForwardTable::new());
        let probes = ProbeRouter::standard(Arc::clone(&registry), Arc::clone(&forwards));
        let session_gate = Arc::new(NoShell::new(config.no_shell));

        Self {
            config,
            registry,
            forwards,
            probes,
            validator,
            operator_keys: Arc::new(operator_keys),
            forward_gate: Arc::new(GrantAllForwards),
            session_gate,
        }
    }
}
