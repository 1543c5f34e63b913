//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::credentials::DEFAULT_SERVICE_USER;

/// Configuration for a client dialing home
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    pub server_address: String,

    /// Service account to authenticate as
    pub service_user: String,

    /// Service account password; prompted for when absent or rejected
    pub service_password: Option<String>,

    /// Expected server host key fingerprint (optional)
    pub server_host_key: Option<String>,

    /// Server-side interface to request the reverse listener on
    pub remote_bind_host: String,

    /// Server-side port to request (0 lets the server choose)
    pub remote_port: u32,

    /// Shell to attach operators to (defaults to `$SHELL`)
    pub shell: Option<String>,

    /// Path to the host key of the local shell server
    pub host_key_path: PathBuf,

    /// Public keys accepted for operator logins
    pub authorized_keys_path: PathBuf,

    /// Connection attempts before giving up on authentication
    pub max_auth_attempts: u32,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Ceiling for graceful shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            server_address: "localhost:4444".to_string(),
            service_user: DEFAULT_SERVICE_USER.to_string(),
            service_password: None,
            server_host_key: None,
            remote_bind_host: "127.0.0.1".to_string(),
            remote_port: 0,
            shell: None,
            host_key_path: config_dir.join("client_host_key"),
            authorized_keys_path: config_dir.join("authorized_keys"),
            max_auth_attempts: 3,
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Shell to spawn, falling back to `$SHELL` then `/bin/sh`
    pub fn resolved_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.remote_port, 0);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_shell_wins() {
        let config = ClientConfig {
            shell: Some("/bin/zsh".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_shell(), "/bin/zsh");
    }
}
