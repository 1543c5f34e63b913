//! SSH connection handler
//!
//! Implements the russh server handler for one client connection: password
//! authentication for the service account, public-key authentication for
//! operators, probe channels, reverse forwards and the interactive-session
//! gate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use revish_core::SessionId;
use revish_protocol::{listen_address, ProbeReply, ProbeStatus, PROBE_PORT};

use crate::control::ProbeContext;
use crate::directory;
use crate::forward;
use crate::policy::{GateContext, SessionRequest};
use crate::state::ServerState;

/// How a connection authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Principal {
    /// Client dialing home with the service account password
    Service,
    /// Operator with an authorized public key
    Operator,
}

/// Handler for a single SSH connection
pub struct ConnectionHandler {
    /// Shared server state
    state: Arc<ServerState>,
    /// Identity of this transport connection
    session_id: SessionId,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Authenticated user and how they authenticated
    principal: Option<(String, Principal)>,
    /// Active reverse forwards, keyed by listening address
    forwards: HashMap<String, CancellationToken>,
    /// Cancelled when the connection ends
    cancel: CancellationToken,
}

impl ConnectionHandler {
    /// Create a handler for a freshly accepted connection
    pub fn new(
        state: Arc<ServerState>,
        session_id: SessionId,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            session_id,
            peer_addr,
            principal: None,
            forwards: HashMap::new(),
            cancel,
        }
    }

    fn gate_context(&self) -> GateContext {
        GateContext {
            user: self
                .principal
                .as_ref()
                .map(|(user, _)| user.clone())
                .unwrap_or_default(),
            remote_addr: self.peer_addr,
        }
    }

    fn authenticated_as(&self, principal: Principal) -> bool {
        matches!(self.principal, Some((_, p)) if p == principal)
    }

    /// Interactive requests are for operators only, and then only if the
    /// session gate agrees
    fn allow(&self, request: SessionRequest) -> bool {
        if !self.authenticated_as(Principal::Operator) {
            tracing::warn!(
                "Refused {} request from service login at {}",
                request,
                self.peer_addr
            );
            return false;
        }
        self.state
            .session_gate
            .authorize(&self.gate_context(), request)
    }

    /// Answer a handled probe with a single reply frame, then close
    fn answer_probe(&self, channel: Channel<Msg>, status: ProbeStatus) {
        let session = self.session_id.short();
        tokio::spawn(async move {
            match ProbeReply::new(status).to_bytes() {
                Ok(frame) => {
                    if let Err(e) = channel.data(&frame[..]).await {
                        tracing::debug!("Failed to answer probe on {}: {}", session, e);
                    }
                }
                Err(e) => tracing::error!("Failed to encode probe reply: {}", e),
            }
            let _ = channel.eof().await;
            let _ = channel.close().await;
        });
    }

    /// Print the directory on an allowed shell or exec request
    fn serve_directory(&self, channel: ChannelId, session: &mut Session) {
        let snapshot = self.state.registry.snapshot();
        let entries = directory::directory_entries(&snapshot, &self.state.config.proxy_user);
        let text = directory::render_text(&entries);

        session.data(channel, CryptoVec::from_slice(text.as_bytes()));
        session.exit_status_request(channel, 0);
        session.eof(channel);
        session.close(channel);
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Stops every reverse forward bound by this connection
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Service account password authentication
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.state.validator.validate(user, password) {
            tracing::info!(
                "Service login {}@{} accepted (session {})",
                user,
                self.peer_addr,
                self.session_id.short()
            );
            self.principal = Some((user.to_string(), Principal::Service));
            return Ok(Auth::Accept);
        }

        tracing::warn!("Password authentication REJECTED for {}@{}", user, self.peer_addr);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.state.operator_keys.is_authorized(public_key) {
            return Ok(Auth::Accept);
        }
        tracing::debug!(
            "Key {} offered by {}@{} is not authorized",
            public_key.fingerprint(),
            user,
            self.peer_addr
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// Operator public-key authentication
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        if self.state.operator_keys.is_authorized(public_key) {
            tracing::info!(
                "Operator login {}@{} accepted, key fingerprint: {} ({})",
                user,
                self.peer_addr,
                fingerprint,
                self.state.operator_keys.comment(public_key).unwrap_or("no comment")
            );
            self.principal = Some((user.to_string(), Principal::Operator));
            return Ok(Auth::Accept);
        }

        tracing::warn!(
            "Public key authentication REJECTED for {}@{} ({})",
            user,
            self.peer_addr,
            fingerprint
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// Session channels are always opened; the requests on them are gated
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Session channel opened: {:?}", channel.id());
        Ok(true)
    }

    /// Probe channels and local port-forwards
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port_to_connect == PROBE_PORT {
            if !self.authenticated_as(Principal::Service) {
                tracing::warn!(
                    "Refused {} probe from operator login at {}",
                    host_to_connect,
                    self.peer_addr
                );
                return Ok(false);
            }
            let ctx = ProbeContext {
                session_id: self.session_id.clone(),
                remote_addr: self.peer_addr,
            };
            return match self
                .state
                .probes
                .dispatch(host_to_connect, &ctx, originator_address)
            {
                Some(status) => {
                    self.answer_probe(channel, status);
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        if !self.allow(SessionRequest::LocalForward) {
            return Ok(false);
        }

        tracing::info!(
            "Local forward from {} to {}:{}",
            self.peer_addr,
            host_to_connect,
            port_to_connect
        );
        tokio::spawn(forward::relay_local_forward(
            channel,
            host_to_connect.to_string(),
            port_to_connect,
            self.cancel.child_token(),
        ));
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.allow(SessionRequest::Pty) {
            tracing::debug!("PTY {} {}x{} on {:?}", term, col_width, row_height, channel);
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.allow(SessionRequest::Shell) {
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);
        self.serve_directory(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.allow(SessionRequest::Exec) {
            session.channel_failure(channel);
            return Ok(());
        }
        tracing::debug!(
            "Exec request from {}: {}",
            self.peer_addr,
            String::from_utf8_lossy(data)
        );
        session.channel_success(channel);
        self.serve_directory(channel, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.allow(SessionRequest::Subsystem) {
            tracing::info!("No subsystem {} available for {}", name, self.peer_addr);
        }
        session.channel_failure(channel);
        Ok(())
    }

    /// Bind a reverse listening address
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated_as(Principal::Service) {
            tracing::warn!(
                "Refused reverse forward {}:{} from operator login at {}",
                address,
                port,
                self.peer_addr
            );
            return Ok(false);
        }
        if !self
            .state
            .forward_gate
            .authorize(&self.gate_context(), address, *port)
        {
            return Ok(false);
        }

        let Ok(requested) = u16::try_from(*port) else {
            tracing::warn!("Reverse forward to invalid port {} refused", port);
            return Ok(false);
        };

        let listener = match TcpListener::bind((address, requested)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Failed to bind reverse forward {}:{}: {}", address, port, e);
                return Ok(false);
            }
        };
        let bound = u32::from(listener.local_addr()?.port());
        *port = bound;

        let key = listen_address(address, bound);
        tracing::info!(
            "Reverse forward {} bound for session {}",
            key,
            self.session_id.short()
        );

        let token = self.cancel.child_token();
        self.state
            .forwards
            .insert(key.clone(), self.session_id.clone());
        self.forwards.insert(key, token.clone());

        tokio::spawn(forward::serve_remote_forward(
            listener,
            session.handle(),
            address.to_string(),
            bound,
            token,
        ));
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let key = listen_address(address, port);
        let Some(token) = self.forwards.remove(&key) else {
            tracing::debug!("No reverse forward {} to cancel", key);
            return Ok(false);
        };

        token.cancel();
        self.state.forwards.remove(&key);
        tracing::info!("Reverse forward {} released", key);
        Ok(true)
    }
}

/// Build the russh server configuration
pub fn ssh_config(host_key: KeyPair, auth_rejection_time: Duration) -> russh::server::Config {
    russh::server::Config {
        keys: vec![host_key],
        methods: MethodSet::PASSWORD | MethodSet::PUBLICKEY,
        auth_rejection_time,
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}
