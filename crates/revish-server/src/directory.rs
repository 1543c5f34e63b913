//! Directory publication
//!
//! An observer task follows the registry and republishes each snapshot as a
//! list of [`DirectoryEntry`] values: to the log, and optionally to a JSON
//! file that external renderers (such as `revish list`) read.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::registry::{DirectoryEntry, Snapshot, Subscription};

/// Follow the registry until it goes away or `cancel` fires
pub async fn run_directory_observer(
    mut subscription: Subscription,
    proxy_user: String,
    output: Option<PathBuf>,
    cancel: CancellationToken,
) {
    tracing::info!(
        "Starting directory observer (file: {})",
        output
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    loop {
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            snapshot = subscription.recv() => match snapshot {
                Some(snapshot) => snapshot,
                None => break,
            },
        };

        let entries = directory_entries(&snapshot, &proxy_user);
        tracing::info!("Directory now lists {} endpoint(s)", entries.len());
        for entry in &entries {
            tracing::debug!(
                "  {} -> {}@{}",
                entry.display_name,
                entry.proxy_user,
                entry.listening_address
            );
        }

        if let Some(path) = &output {
            if let Err(e) = write_directory_file(path, &entries).await {
                tracing::warn!("Failed to publish directory to {:?}: {:#}", path, e);
            }
        }
    }

    // Nothing stays reachable once the server is gone
    if let Some(path) = &output {
        if let Err(e) = write_directory_file(path, &[]).await {
            tracing::warn!("Failed to clear directory at {:?}: {:#}", path, e);
        }
    }

    tracing::info!("Directory observer stopped");
}

/// Directory view of a snapshot
pub fn directory_entries(snapshot: &Snapshot, proxy_user: &str) -> Vec<DirectoryEntry> {
    snapshot
        .iter()
        .map(|endpoint| endpoint.directory_entry(proxy_user))
        .collect()
}

/// Replace the directory file atomically
pub async fn write_directory_file(path: &Path, entries: &[DirectoryEntry]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec_pretty(entries).context("Failed to encode directory")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

/// Read a directory file written by [`write_directory_file`]
pub fn read_directory_file(path: &Path) -> Result<Vec<DirectoryEntry>> {
    let raw =
        std::fs::read(path).with_context(|| format!("Failed to read directory {:?}", path))?;
    serde_json::from_slice(&raw).with_context(|| format!("Failed to parse directory {:?}", path))
}

/// Plain-text listing, one endpoint per line
pub fn render_text(entries: &[DirectoryEntry]) -> String {
    if entries.is_empty() {
        return "No reachable sessions\r\n".to_string();
    }

    let width = entries
        .iter()
        .map(|e| e.display_name.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for entry in entries {
        let _ = write!(
            out,
            "{:width$}  ssh -J <this server> -p {} {}@{}\r\n",
            entry.display_name,
            port_of(&entry.listening_address),
            entry.proxy_user,
            host_of(&entry.listening_address),
            width = width
        );
    }
    out
}

fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    }
}

fn port_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(_, port)| port).unwrap_or("22")
}
