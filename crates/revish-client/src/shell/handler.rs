//! SSH server for operators arriving through the tunnel
//!
//! Every forwarded connection carries a complete SSH session from an
//! operator. Operators authenticate by public key and get the configured
//! shell on a PTY; anything that is not an interactive terminal is refused.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use revish_core::keys::AuthorizedKeys;

use super::pty::{spawn_shell, PtyOutput, PtyShell, TerminalSize};

/// Message sent to operators who did not request a terminal
const TERMINAL_REQUIRED: &str = "interactive terminal required\r\n";

/// Output chunks buffered between the PTY thread and the channel
const OUTPUT_BUFFER: usize = 64;

/// Serves operator sessions on forwarded streams
#[derive(Clone)]
pub struct ShellServer {
    config: Arc<russh::server::Config>,
    authorized_keys: Arc<AuthorizedKeys>,
    shell: String,
}

impl ShellServer {
    pub fn new(host_key: KeyPair, authorized_keys: Arc<AuthorizedKeys>, shell: String) -> Self {
        let config = russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            authorized_keys,
            shell,
        }
    }

    /// Run one operator session to completion
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = ShellHandler::new(Arc::clone(&self.authorized_keys), self.shell.clone());
        russh::server::run_stream(Arc::clone(&self.config), stream, handler)
            .await?
            .await?;
        Ok(())
    }
}

/// Terminal requested on a channel before the shell starts
#[derive(Debug, Clone)]
struct TerminalRequest {
    term: String,
    size: TerminalSize,
}

/// Handler for one operator connection
pub struct ShellHandler {
    authorized_keys: Arc<AuthorizedKeys>,
    shell: String,
    terminals: HashMap<ChannelId, TerminalRequest>,
    shells: HashMap<ChannelId, PtyShell>,
}

impl ShellHandler {
    fn new(authorized_keys: Arc<AuthorizedKeys>, shell: String) -> Self {
        Self {
            authorized_keys,
            shell,
            terminals: HashMap::new(),
            shells: HashMap::new(),
        }
    }

    /// Reject a non-interactive request with an explicit reason
    fn refuse(&self, channel: ChannelId, session: &mut Session) {
        session.channel_failure(channel);
        session.extended_data(channel, 1, CryptoVec::from_slice(TERMINAL_REQUIRED.as_bytes()));
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
    }
}

impl Drop for ShellHandler {
    fn drop(&mut self) {
        for shell in self.shells.values_mut() {
            shell.kill();
        }
    }
}

#[async_trait]
impl Handler for ShellHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.authorized_keys.is_authorized(public_key) {
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        if self.authorized_keys.is_authorized(public_key) {
            tracing::info!(
                "Operator {} authenticated with key {} ({})",
                user,
                fingerprint,
                self.authorized_keys.comment(public_key).unwrap_or("no comment")
            );
            return Ok(Auth::Accept);
        }
        tracing::warn!("Operator {} offered unauthorized key {}", user, fingerprint);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
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
        self.terminals.insert(
            channel,
            TerminalRequest {
                term: term.to_string(),
                size: TerminalSize::from_request(col_width, row_height),
            },
        );
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(terminal) = self.terminals.remove(&channel) else {
            tracing::warn!("Shell requested without a PTY; refusing");
            self.refuse(channel, session);
            return Ok(());
        };

        let (shell, output) = match spawn_shell(&self.shell, &terminal.term, terminal.size) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("Failed to start shell: {:#}", e);
                session.channel_failure(channel);
                session.close(channel);
                return Ok(());
            }
        };

        session.channel_success(channel);
        self.shells.insert(channel, shell);
        tokio::spawn(pump_output(output, session.handle(), channel));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::warn!(
            "Refusing exec of {:?}: interactive terminal required",
            String::from_utf8_lossy(data)
        );
        self.refuse(channel, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::warn!("Refusing subsystem {}", name);
        self.refuse(channel, session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = self.shells.get_mut(&channel) {
            if let Err(e) = shell.write(data) {
                tracing::debug!("Dropping input for {:?}: {:#}", channel, e);
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = TerminalSize::from_request(col_width, row_height);
        if let Some(shell) = self.shells.get(&channel) {
            if let Err(e) = shell.resize(size) {
                tracing::debug!("{:#}", e);
            }
        } else if let Some(terminal) = self.terminals.get_mut(&channel) {
            terminal.size = size;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.terminals.remove(&channel);
        if let Some(mut shell) = self.shells.remove(&channel) {
            tracing::debug!("Channel closed; stopping shell {:?}", shell.pid());
            shell.kill();
        }
        Ok(())
    }
}

/// Relay PTY output to the channel, then report the exit status
async fn pump_output(mut output: PtyOutput, handle: Handle, channel: ChannelId) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER);

    let reader = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
        drop(tx);
        output.wait()
    });

    while let Some(chunk) = rx.recv().await {
        if handle.data(channel, CryptoVec::from(chunk)).await.is_err() {
            tracing::debug!("Channel {:?} gone; discarding shell output", channel);
            break;
        }
    }
    // Unblocks the reader thread if the channel went away first
    drop(rx);

    let code = match reader.await {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!("Shell reader task failed: {}", e);
            1
        }
    };
    tracing::info!("Shell exited with status {}", code);

    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
