//! `revish list`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use revish_core::config::{self, ServerConfig};
use revish_server::directory::read_directory_file;

use crate::output::format_directory;

/// Render the directory file published by a running server
pub fn list_command(
    directory: Option<PathBuf>,
    config_path: Option<&Path>,
    jump_host: &str,
    json: bool,
) -> Result<()> {
    let path = match directory {
        Some(path) => path,
        None => {
            let config: ServerConfig =
                config::load_or_default(config_path, config::default_server_config_path())
                    .context("Failed to load server configuration")?;
            config.directory_path()
        }
    };

    let entries = read_directory_file(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{}", format_directory(&entries, jump_host));
    }
    Ok(())
}
