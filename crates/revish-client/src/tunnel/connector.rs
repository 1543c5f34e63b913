//! Outbound SSH connection to the rendezvous server
//!
//! Dials the server with the service account, binds the reverse listening
//! address with `tcpip-forward` and carries probes as `direct-tcpip` opens
//! (see [`revish_protocol::probe`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, ChannelStream, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Decoder;

use revish_core::config::ClientConfig;
use revish_core::credentials::ServiceCredentials;
use revish_protocol::{
    listen_address, ProbeKind, ProbeOutcome, RegistrationMessage, ReplyCodec, PROBE_PORT,
};

use super::{ControlConnection, DialError, Dialer, ForwardListener, ProbeError};

/// Forwarded connections buffered before the listener accepts them
const FORWARDED_CHANNEL_CAPACITY: usize = 32;

/// Dials the server over SSH
pub struct SshDialer {
    /// russh client configuration
    config: Arc<Config>,
    /// Server address (`host:port`)
    server_address: String,
    /// Expected server host key fingerprint
    server_host_key: Option<String>,
    /// Limit on connection establishment
    connect_timeout: Duration,
}

impl SshDialer {
    /// Create a dialer from client configuration
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            config: Arc::new(Config::default()),
            server_address: config.server_address.clone(),
            server_host_key: config.server_host_key.clone(),
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    type Conn = SshConnection;

    async fn dial(&self, credentials: &ServiceCredentials) -> Result<SshConnection, DialError> {
        let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let handler = ClientHandler::new(self.server_host_key.clone(), forwarded_tx);

        tracing::info!("Dialling home via ssh to {}", self.server_address);
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::clone(&self.config), &self.server_address, handler),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Connection to {} timed out", self.server_address))?
        .map_err(|e| {
            if matches!(e.downcast_ref::<russh::Error>(), Some(russh::Error::UnknownKey)) {
                return DialError::HostKeyRejected(format!(
                    "{} presented an unexpected host key",
                    self.server_address
                ));
            }
            DialError::Other(e.context(format!("Failed to connect to {}", self.server_address)))
        })?;

        tracing::debug!("Authenticating as service user '{}'", credentials.user);
        let authenticated = handle
            .authenticate_password(&credentials.user, &credentials.password)
            .await
            .map_err(|e| anyhow::anyhow!("Authentication error: {}", e))?;

        if !authenticated {
            return Err(DialError::AuthRejected);
        }

        tracing::info!("Authenticated to {}", self.server_address);
        Ok(SshConnection {
            handle: Arc::new(Mutex::new(handle)),
            forwarded_rx: Some(forwarded_rx),
        })
    }
}

/// Authenticated SSH connection to the server
pub struct SshConnection {
    /// Session handle, shared with the reverse listener
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    /// Forwarded channels, handed to the listener once it is bound
    forwarded_rx: Option<mpsc::Receiver<Channel<Msg>>>,
}

#[async_trait]
impl ControlConnection for SshConnection {
    type Listener = SshForwardListener;

    async fn request_reverse_listen(&mut self, host: &str, port: u32) -> Result<SshForwardListener> {
        let incoming = self
            .forwarded_rx
            .take()
            .context("A reverse listener is already bound on this connection")?;

        let bound = self
            .handle
            .lock()
            .await
            .tcpip_forward(host, port)
            .await
            .with_context(|| format!("Server refused to listen on {}:{}", host, port))?;

        // Servers that do not report the port echo zero back
        let bound = if bound == 0 { port } else { bound };

        Ok(SshForwardListener {
            handle: Arc::clone(&self.handle),
            host: host.to_string(),
            port: bound,
            address: listen_address(host, bound),
            incoming: Some(incoming),
        })
    }

    async fn open_probe(
        &self,
        kind: ProbeKind,
        message: &RegistrationMessage,
    ) -> Result<ProbeOutcome, ProbeError> {
        let payload = message.to_probe_payload()?;

        let opened = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(kind.as_str(), PROBE_PORT, payload, 0)
            .await;

        let mut channel = match opened {
            Ok(channel) => channel,
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                tracing::debug!("{} probe refused: {:?}", kind, reason);
                return Ok(ProbeOutcome::Unsupported);
            }
            Err(e) => return Err(ProbeError::Transport(e.to_string())),
        };

        let outcome = read_reply(&mut channel).await;
        tracing::debug!("{} probe answered: {:?}", kind, outcome);
        outcome
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await?;
        Ok(())
    }
}

/// Read the single reply frame a handled probe answers with
async fn read_reply(channel: &mut Channel<Msg>) -> Result<ProbeOutcome, ProbeError> {
    let mut codec = ReplyCodec::new();
    let mut buffer = BytesMut::new();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                buffer.extend_from_slice(data);
                if let Some(reply) = codec.decode(&mut buffer)? {
                    return Ok(ProbeOutcome::Rejected(reply.status));
                }
            }
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }

    Err(ProbeError::Truncated)
}

/// Reverse listening address bound on the server
pub struct SshForwardListener {
    /// Session handle, used to release the address
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    /// Requested bind host
    host: String,
    /// Bound port
    port: u32,
    /// `host:port` as advertised to the directory
    address: String,
    /// Forwarded channels; `None` once released
    incoming: Option<mpsc::Receiver<Channel<Msg>>>,
}

#[async_trait]
impl ForwardListener for SshForwardListener {
    type Stream = ChannelStream<Msg>;

    fn local_address(&self) -> &str {
        &self.address
    }

    async fn accept(&mut self) -> Option<ChannelStream<Msg>> {
        let channel = self.incoming.as_mut()?.recv().await?;
        Some(channel.into_stream())
    }

    async fn close(&mut self) -> Result<()> {
        if self.incoming.take().is_none() {
            return Ok(());
        }
        tracing::debug!("Releasing reverse listener {}", self.address);
        self.handle
            .lock()
            .await
            .cancel_tcpip_forward(self.host.as_str(), self.port)
            .await
            .with_context(|| format!("Failed to release {}", self.address))?;
        Ok(())
    }
}

/// SSH client handler for the connection home
pub struct ClientHandler {
    /// Expected host key fingerprint (for verification)
    expected_host_key: Option<String>,
    /// Where forwarded channels are delivered
    forwarded_tx: mpsc::Sender<Channel<Msg>>,
}

impl ClientHandler {
    fn new(expected_host_key: Option<String>, forwarded_tx: mpsc::Sender<Channel<Msg>>) -> Self {
        Self {
            expected_host_key,
            forwarded_tx,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key against the configured fingerprint
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        match &self.expected_host_key {
            Some(expected) if fingerprint != *expected => {
                tracing::error!(
                    "Host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            Some(_) => {
                tracing::debug!("Host key verified against configured fingerprint");
                Ok(true)
            }
            None => {
                tracing::warn!(
                    "No server host key configured; accepting {} unverified",
                    fingerprint
                );
                Ok(true)
            }
        }
    }

    /// A connection arrived through the reverse listening address
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::info!(
            "Forwarded connection from {}:{} via {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );

        if let Err(channel) = offer_forwarded(&self.forwarded_tx, channel) {
            // Closing from a task keeps the session loop free to read replies
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
        }
        Ok(())
    }
}

/// Queue a forwarded connection without waiting on the listener.
///
/// Hands the item back when the backlog is full or the listener is gone.
fn offer_forwarded<T>(tx: &mpsc::Sender<T>, item: T) -> Result<(), T> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(item)) => {
            tracing::warn!(
                "{} forwarded connections already pending; refusing another",
                FORWARDED_CHANNEL_CAPACITY
            );
            Err(item)
        }
        Err(mpsc::error::TrySendError::Closed(item)) => {
            tracing::debug!("Reverse listener released; dropping forwarded connection");
            Err(item)
        }
    }
}
