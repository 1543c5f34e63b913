//! `revish server`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use revish_core::config::{self, ServerConfig};
use revish_core::keys::{expand_home, load_or_generate_host_key};
use revish_server::directory::run_directory_observer;
use revish_server::{ServerState, SshServer};

use super::shutdown_signal;
use crate::output::{print_info, print_success};

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Interface to listen on (overrides config)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Broker tunnels only; refuse every shell, exec and local forward
    #[arg(long)]
    pub no_shell: bool,

    /// Service account name
    #[arg(long)]
    pub user: Option<String>,

    /// Service account password
    #[arg(long, env = "REVISH_SERVICE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Publish the directory as JSON to this file
    #[arg(long)]
    pub directory_file: Option<PathBuf>,
}

impl ServerArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_shell {
            config.no_shell = true;
        }
        if let Some(user) = self.user {
            config.service_user = user;
        }
        if let Some(password) = self.password {
            config.service_password = Some(password);
            config.service_password_sha256 = None;
        }
        if let Some(path) = self.directory_file {
            config.directory_file = Some(path);
        }
    }
}

/// Run the rendezvous server until SIGINT/SIGTERM
pub async fn run_server(args: ServerArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config: ServerConfig =
        config::load_or_default(config_path, config::default_server_config_path())
            .context("Failed to load server configuration")?;
    args.apply(&mut config);

    tracing::info!("revish server starting...");

    let host_key = load_or_generate_host_key(&expand_home(&config.host_key_path)).await?;
    let fingerprint = host_key
        .clone_public_key()
        .context("Failed to extract public key from host key")?
        .fingerprint();
    tracing::info!("Host key fingerprint: {}", fingerprint);

    let shutdown_timeout = config.shutdown_timeout;
    let proxy_user = config.proxy_user.clone();
    let directory_file = config.directory_path();
    let no_shell = config.no_shell;

    let state = Arc::new(ServerState::from_config(config)?);
    let cancel = CancellationToken::new();

    let observer = tokio::spawn(run_directory_observer(
        state.registry.subscribe(),
        proxy_user,
        Some(directory_file),
        cancel.clone(),
    ));

    let server = SshServer::bind(host_key, Arc::clone(&state), cancel.clone()).await?;
    print_success(&format!("Listening on {}", server.local_addr()?));
    print_info(&format!("Host key fingerprint: {}", fingerprint));
    if no_shell {
        print_info("No-shell mode: interactive sessions are refused");
    }

    let mut running = tokio::spawn(server.run());

    tokio::select! {
        result = &mut running => {
            cancel.cancel();
            return result.context("Server task failed")?;
        }
        _ = shutdown_signal() => {}
    }

    cancel.cancel();
    let stopped = async {
        let result = running.await;
        let _ = observer.await;
        result
    };
    match tokio::time::timeout(shutdown_timeout, stopped).await {
        Ok(result) => result.context("Server task failed")?,
        Err(_) => anyhow::bail!("Shutdown did not complete within {:?}", shutdown_timeout),
    }
}
