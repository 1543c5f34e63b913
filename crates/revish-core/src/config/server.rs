//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::credentials::{SharedSecret, DEFAULT_SERVICE_USER};
use crate::error::ConfigError;
use crate::keys::expand_home;

/// Configuration for the rendezvous server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on
    pub listen: String,

    /// Port to listen on
    pub port: u16,

    /// Path to the host key file
    pub host_key_path: PathBuf,

    /// Service account clients dial home with
    pub service_user: String,

    /// Service account password in plain text
    pub service_password: Option<String>,

    /// Hex SHA-256 digest of the service account password
    pub service_password_sha256: Option<String>,

    /// Public keys accepted for operator logins
    pub operator_keys_path: PathBuf,

    /// Deny all shell, exec, subsystem and local port-forward requests
    pub no_shell: bool,

    /// User name operators log into clients as, shown in the directory
    pub proxy_user: String,

    /// Where to publish the directory as JSON, defaulting to
    /// `directory.json` in the configuration directory
    pub directory_file: Option<PathBuf>,

    /// Delay before answering a failed authentication
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,

    /// Ceiling for graceful shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            listen: "0.0.0.0".to_string(),
            port: 4444,
            host_key_path: config_dir.join("server_host_key"),
            service_user: DEFAULT_SERVICE_USER.to_string(),
            service_password: None,
            service_password_sha256: None,
            operator_keys_path: config_dir.join("authorized_keys"),
            no_shell: false,
            proxy_user: whoami::username(),
            directory_file: None,
            auth_rejection_time: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    /// Directory file the server publishes and `revish list` reads
    pub fn directory_path(&self) -> PathBuf {
        self.directory_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(super::default_directory_path)
    }

    /// Build the service account validator.
    ///
    /// A digest takes precedence over a plain-text password.
    pub fn service_secret(&self) -> Result<SharedSecret, ConfigError> {
        if let Some(digest) = &self.service_password_sha256 {
            return SharedSecret::from_hex_digest(&self.service_user, digest);
        }
        match &self.service_password {
            Some(password) if !password.is_empty() => {
                Ok(SharedSecret::from_password(&self.service_user, password))
            }
            _ => Err(ConfigError::MissingField(
                "service_password or service_password_sha256".to_string(),
            )),
        }
    }
}
