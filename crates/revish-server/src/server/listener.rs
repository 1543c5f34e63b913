//! SSH server listener
//!
//! Accepts incoming connections and runs a handler for each. When a
//! connection ends, its endpoints and reverse forwards are reclaimed whether
//! or not the client unregistered.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::Disconnect;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use revish_core::SessionId;

use crate::server::handler::{ssh_config, ConnectionHandler};
use crate::state::ServerState;

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// russh server configuration
    config: Arc<russh::server::Config>,
    /// Shared server state
    state: Arc<ServerState>,
    /// Bound listening socket
    listener: TcpListener,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl SshServer {
    /// Bind the configured listen address
    pub async fn bind(
        host_key: KeyPair,
        state: Arc<ServerState>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let bind_addr = state.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        let config = ssh_config(host_key, state.config.auth_rejection_time);

        Ok(Self {
            config: Arc::new(config),
            state,
            listener,
            cancel,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("SSH server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Run one connection on its own task
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = SessionId::generate();
        tracing::info!(
            "New connection from {} (session {})",
            peer_addr,
            session_id.short()
        );

        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                Arc::clone(&state),
                session_id.clone(),
                peer_addr,
                cancel.clone(),
            );

            match russh::server::run_stream(config, socket, handler).await {
                Ok(running) => {
                    let handle = running.handle();
                    tokio::pin!(running);

                    tokio::select! {
                        result = &mut running => match result {
                            Ok(()) => {
                                tracing::info!("Connection from {} closed normally", peer_addr);
                            }
                            Err(e) => {
                                tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                            }
                        },
                        _ = cancel.cancelled() => {
                            tracing::debug!("Disconnecting {} for shutdown", peer_addr);
                            let _ = handle
                                .disconnect(
                                    Disconnect::ByApplication,
                                    "server shutting down".to_string(),
                                    "en".to_string(),
                                )
                                .await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                }
            }

            cancel.cancel();
            release_session(&state, &session_id);
        });
    }
}

/// Reclaim everything a closed connection left behind
fn release_session(state: &ServerState, session_id: &SessionId) {
    let forwards = state.forwards.clear_session(session_id);
    let endpoints = state.registry.purge_session(session_id);
    if forwards > 0 || endpoints > 0 {
        tracing::info!(
            "Session {} released {} forward(s) and {} stale endpoint(s)",
            session_id.short(),
            forwards,
            endpoints
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revish_core::config::ServerConfig;
    use revish_core::credentials::SharedSecret;
    use revish_core::keys::AuthorizedKeys;
    use revish_protocol::RegistrationMessage;

    use crate::registry::Endpoint;

    #[test]
    fn test_release_session_reclaims_endpoints_and_forwards() {
        let state = ServerState::new(
            ServerConfig::default(),
            Arc::new(SharedSecret::from_password("revish", "pw")),
            AuthorizedKeys::new(),
        );
        let gone = SessionId::new(vec![1]);
        let alive = SessionId::new(vec![2]);

        state.forwards.insert("127.0.0.1:40000".to_string(), gone.clone());
        state.forwards.insert("127.0.0.1:40001".to_string(), alive.clone());
        for (id, address) in [(&gone, "127.0.0.1:40000"), (&alive, "127.0.0.1:40001")] {
            state.registry.add(Endpoint::from_registration(
                id.clone(),
                "10.0.0.5:50000".parse().unwrap(),
                RegistrationMessage::new("alice", "box", address),
            ));
        }

        release_session(&state, &gone);

        assert_eq!(state.registry.len(), 1);
        assert_eq!(state.registry.snapshot()[0].session_id, alive);
        assert_eq!(state.forwards.holder("127.0.0.1:40000"), None);
        assert_eq!(state.forwards.holder("127.0.0.1:40001"), Some(alive));
    }
}
