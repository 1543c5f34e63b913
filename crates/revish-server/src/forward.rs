//! Port-forward plumbing
//!
//! Reverse forwards (`tcpip-forward`) bind a TCP listener on the server and
//! relay every inbound connection back to the owning client through a
//! `forwarded-tcpip` channel. Local forwards (`direct-tcpip`) relay a
//! channel to a TCP target reachable from the server.

use std::net::SocketAddr;

use dashmap::DashMap;
use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use revish_core::SessionId;

/// Which connection holds each bound reverse listening address
#[derive(Debug, Default)]
pub struct ForwardTable {
    /// Listening address (`host:port`) to owning session
    holders: DashMap<String, SessionId>,
}

impl ForwardTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            holders: DashMap::new(),
        }
    }

    /// Record that `session_id` holds `address`
    pub fn insert(&self, address: String, session_id: SessionId) {
        if let Some(previous) = self.holders.insert(address.clone(), session_id) {
            tracing::warn!(
                "Listening address {} was still recorded for session {}",
                address,
                previous.short()
            );
        }
    }

    /// Forget a single address
    pub fn remove(&self, address: &str) -> Option<SessionId> {
        self.holders.remove(address).map(|(_, id)| id)
    }

    /// Session holding `address`, if any
    pub fn holder(&self, address: &str) -> Option<SessionId> {
        self.holders.get(address).map(|r| r.value().clone())
    }

    /// Whether `address` is held by `session_id`
    pub fn is_held_by(&self, address: &str, session_id: &SessionId) -> bool {
        self.holders
            .get(address)
            .map(|r| r.value() == session_id)
            .unwrap_or(false)
    }

    /// Forget every address held by a session. Returns how many were dropped.
    pub fn clear_session(&self, session_id: &SessionId) -> usize {
        let before = self.holders.len();
        self.holders.retain(|_, holder| holder != session_id);
        before.saturating_sub(self.holders.len())
    }

    /// Number of bound addresses
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Check if no address is bound
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

/// Accept connections on a reverse-forward listener until cancelled.
///
/// Each accepted connection is announced to the client as a
/// `forwarded-tcpip` channel for `connected_address:connected_port`.
pub async fn serve_remote_forward(
    listener: TcpListener,
    handle: Handle,
    connected_address: String,
    connected_port: u32,
    cancel: CancellationToken,
) {
    tracing::debug!(
        "Reverse forward {}:{} accepting",
        connected_address,
        connected_port
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(
                    "Reverse forward {}:{} stopped",
                    connected_address,
                    connected_port
                );
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        tokio::spawn(forward_to_client(
                            socket,
                            peer,
                            handle.clone(),
                            connected_address.clone(),
                            connected_port,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to accept on reverse forward {}:{}: {}",
                            connected_address,
                            connected_port,
                            e
                        );
                    }
                }
            }
        }
    }
}

async fn forward_to_client(
    socket: TcpStream,
    peer: SocketAddr,
    handle: Handle,
    connected_address: String,
    connected_port: u32,
    cancel: CancellationToken,
) {
    tracing::debug!(
        "Forwarding {} through reverse tunnel {}:{}",
        peer,
        connected_address,
        connected_port
    );

    let channel = match handle
        .channel_open_forwarded_tcpip(
            connected_address,
            connected_port,
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("Client refused forwarded connection from {}: {}", peer, e);
            return;
        }
    };

    relay(socket, channel.into_stream(), cancel).await;
}

/// Relay a local-forward channel to `host:port`
pub async fn relay_local_forward(
    channel: Channel<Msg>,
    host: String,
    port: u32,
    cancel: CancellationToken,
) {
    let Ok(port16) = u16::try_from(port) else {
        tracing::warn!("Local forward to invalid port {}", port);
        let _ = channel.close().await;
        return;
    };

    match TcpStream::connect((host.as_str(), port16)).await {
        Ok(target) => {
            tracing::debug!("Local forward to {}:{} connected", host, port);
            relay(target, channel.into_stream(), cancel).await;
        }
        Err(e) => {
            tracing::warn!("Local forward to {}:{} failed: {}", host, port, e);
            let _ = channel.close().await;
        }
    }
}

/// Copy bytes both ways until either side closes or `cancel` fires
async fn relay<A, B>(mut a: A, mut b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => {
            match result {
                Ok((up, down)) => tracing::trace!("Relay closed ({} bytes up, {} down)", up, down),
                Err(e) => tracing::debug!("Relay ended with error: {}", e),
            }
        }
    }
}
