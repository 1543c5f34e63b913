//! `revish client`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use revish_client::shell::{validate_shell_path, ShellServer};
use revish_client::tunnel::SshDialer;
use revish_client::{TunnelClient, TunnelSettings};
use revish_core::config::{self, ClientConfig};
use revish_core::keys::{expand_home, load_or_generate_host_key, AuthorizedKeys};
use revish_core::HostIdentity;

use super::shutdown_signal;
use crate::output::{print_success, print_warning};
use crate::prompt::DialoguerCredentials;

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// Server to dial (`host:port`, overrides config)
    pub server: Option<String>,

    /// Server-side interface for the reverse listener
    #[arg(long)]
    pub remote_host: Option<String>,

    /// Server-side port for the reverse listener (0 lets the server choose)
    #[arg(long)]
    pub remote_port: Option<u32>,

    /// Shell to give operators
    #[arg(short, long)]
    pub shell: Option<String>,

    /// Service account name
    #[arg(short, long)]
    pub user: Option<String>,

    /// Service account password (prompted for when absent)
    #[arg(long, env = "REVISH_SERVICE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Expected server host key fingerprint
    #[arg(long)]
    pub server_key: Option<String>,

    /// Public keys allowed to log in through the tunnel
    #[arg(long)]
    pub authorized_keys: Option<PathBuf>,
}

impl ClientArgs {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(server) = self.server {
            config.server_address = server;
        }
        if let Some(host) = self.remote_host {
            config.remote_bind_host = host;
        }
        if let Some(port) = self.remote_port {
            config.remote_port = port;
        }
        if let Some(shell) = self.shell {
            config.shell = Some(shell);
        }
        if let Some(user) = self.user {
            config.service_user = user;
        }
        if let Some(password) = self.password {
            config.service_password = Some(password);
        }
        if let Some(key) = self.server_key {
            config.server_host_key = Some(key);
        }
        if let Some(path) = self.authorized_keys {
            config.authorized_keys_path = path;
        }
    }
}

/// Dial home, register, and serve operator shells until SIGINT/SIGTERM
pub async fn run_client(args: ClientArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config: ClientConfig =
        config::load_or_default(config_path, config::default_client_config_path())
            .context("Failed to load client configuration")?;
    args.apply(&mut config);

    let shell = validate_shell_path(&config.resolved_shell())?;
    let host_key = load_or_generate_host_key(&expand_home(&config.host_key_path)).await?;
    let operators = AuthorizedKeys::load_or_empty(&config.authorized_keys_path)?;
    if operators.is_empty() {
        print_warning("No authorized operator keys; nobody will be able to log in");
    }
    let shells = ShellServer::new(host_key, Arc::new(operators), shell);

    let user = config.service_user.clone();
    let password = config.service_password.clone();
    let credentials = tokio::task::spawn_blocking(move || DialoguerCredentials::new(user, password))
        .await
        .context("Password prompt task failed")??;

    let client = TunnelClient::new(
        SshDialer::new(&config),
        Arc::new(credentials),
        HostIdentity::detect(),
        TunnelSettings::from_config(&config),
    );

    let tunnel = client.establish().await?;
    print_success(&format!(
        "Listening at home on {} via {}",
        tunnel.listening_address(),
        config.server_address
    ));

    tunnel
        .serve(
            move |stream| {
                let shells = shells.clone();
                async move {
                    if let Err(e) = shells.serve(stream).await {
                        tracing::warn!("Operator session ended with error: {:#}", e);
                    }
                }
            },
            shutdown_signal(),
        )
        .await?;

    Ok(())
}
