//! Host keys and authorized operator keys

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::{KeyPair, PublicKey};

/// Load a host key, generating and persisting an Ed25519 key if none exists
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .with_context(|| "Failed to encode host key")?;
    tokio::fs::write(path, pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(key)
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap_or(path));
        }
    }
    path.to_path_buf()
}

/// Manages authorized public keys for operator authentication
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    /// Key comments, keyed by fingerprint
    keys: HashMap<String, Option<String>>,
}

impl AuthorizedKeys {
    /// Create a new empty authorized keys store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load authorized keys from a file, tolerating its absence
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        let mut store = Self::new();
        let expanded = expand_home(path);
        if expanded.exists() {
            store.load_from_file(&expanded)?;
        } else {
            tracing::warn!("Authorized keys file not found: {:?}", expanded);
        }
        Ok(store)
    }

    /// Load authorized keys from a single file
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        tracing::info!("Loading authorized keys from {:?}", path);

        let file =
            std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

        let reader = BufReader::new(file);
        let mut count = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_openssh_line(line) {
                Some(key) => {
                    self.add_key(&key, extract_comment(line));
                    count += 1;
                }
                None => {
                    tracing::warn!("Failed to parse key on line {} of {:?}", line_num + 1, path);
                }
            }
        }

        tracing::info!("Loaded {} authorized keys from {:?}", count, path);
        Ok(())
    }

    /// Check if a public key is authorized
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.keys.contains_key(&key.fingerprint())
    }

    /// Comment recorded for an authorized key, for log lines
    pub fn comment(&self, key: &PublicKey) -> Option<&str> {
        self.keys.get(&key.fingerprint())?.as_deref()
    }

    /// Add a public key to the authorized set
    pub fn add_key(&mut self, key: &PublicKey, comment: Option<String>) {
        let fingerprint = key.fingerprint();
        tracing::debug!(
            "Authorized key: {} ({})",
            fingerprint,
            comment.as_deref().unwrap_or("no comment")
        );
        self.keys.insert(fingerprint, comment);
    }

    /// Get the number of authorized keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if there are no authorized keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Parse an OpenSSH public key line (`type base64 [comment]` or bare base64)
fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [bare] => russh_keys::parse_public_key_base64(bare).ok(),
        [_, base64, ..] => russh_keys::parse_public_key_base64(base64).ok(),
        [] => None,
    }
}

/// Extract the comment from an OpenSSH public key line
fn extract_comment(line: &str) -> Option<String> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() >= 3 {
        Some(parts[2].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_skips_comments_and_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Comment line").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ssh-ed25519 not-base64 broken@example.com").unwrap();

        let mut store = AuthorizedKeys::new();
        store.load_from_file(file.path()).unwrap();

        assert!(store.is_empty());
    }

    #[test]
    fn test_load_generated_key() {
        let key = KeyPair::generate_ed25519().unwrap();
        let public = key.clone_public_key().unwrap();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{} {} operator@example.com",
            public.name(),
            public.public_key_base64()
        )
        .unwrap();

        let mut store = AuthorizedKeys::new();
        store.load_from_file(file.path()).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.is_authorized(&public));
        assert_eq!(store.comment(&public), Some("operator@example.com"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorizedKeys::load_or_empty(&dir.path().join("absent")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_key_is_not_authorized() {
        let mut store = AuthorizedKeys::new();
        let known = KeyPair::generate_ed25519().unwrap().clone_public_key().unwrap();
        let other = KeyPair::generate_ed25519().unwrap().clone_public_key().unwrap();
        store.add_key(&known, None);

        assert!(store.is_authorized(&known));
        assert!(!store.is_authorized(&other));
        assert_eq!(store.comment(&known), None);
    }

    #[tokio::test]
    async fn test_host_key_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let first = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());
        let second = load_or_generate_host_key(&path).await.unwrap();

        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint()
        );
    }
}
