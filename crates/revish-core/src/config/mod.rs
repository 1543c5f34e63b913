//! Configuration management for revish

mod client;
pub mod serde_utils;
mod server;

pub use client::ClientConfig;
pub use server::ServerConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("revish")
}

/// Default path of the server configuration file
pub fn default_server_config_path() -> PathBuf {
    default_config_dir().join("server.toml")
}

/// Default path of the published directory
pub fn default_directory_path() -> PathBuf {
    default_config_dir().join("directory.json")
}

/// Default path of the client configuration file
pub fn default_client_config_path() -> PathBuf {
    default_config_dir().join("client.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration from `path`, or the default location, or defaults
pub fn load_or_default<T>(path: Option<&Path>, default_path: PathBuf) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match path {
        Some(path) => load_config(path),
        None if default_path.exists() => load_config(&default_path),
        None => {
            tracing::debug!("No config at {:?}, using defaults", default_path);
            Ok(T::default())
        }
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");

        let mut config = ServerConfig::default();
        config.port = 2200;
        config.no_shell = true;
        save_config(&path, &config).unwrap();

        let loaded: ServerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.port, 2200);
        assert!(loaded.no_shell);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ClientConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config: ClientConfig =
            load_or_default(None, dir.path().join("client.toml")).unwrap();
        assert_eq!(config.max_auth_attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "server_address = \"home.example.com:4444\"\n").unwrap();

        let config: ClientConfig = load_config(&path).unwrap();
        assert_eq!(config.server_address, "home.example.com:4444");
        assert_eq!(config.remote_bind_host, "127.0.0.1");
    }
}
