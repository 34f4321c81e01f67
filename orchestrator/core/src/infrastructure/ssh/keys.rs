// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host key, identity and authorized_keys handling.

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::TransportError;

/// Load the host key from `path`, generating and saving an Ed25519 key if
/// the file does not exist yet.
pub async fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey, TransportError> {
    if path.exists() {
        info!("Loading host key from {}", path.display());
        return russh::keys::load_secret_key(path, None).map_err(|e| {
            TransportError::HostKey(format!("failed to load {}: {}", path.display(), e))
        });
    }

    info!("Generating new Ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| TransportError::HostKey(format!("failed to generate host key: {}", e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| TransportError::HostKey(format!("failed to encode host key: {}", e)))?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}

/// Parse an OpenSSH authorized_keys file. Lines that do not parse are skipped.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>, TransportError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TransportError::HostKey(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(parse_authorized_keys(&content))
}

pub fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_entry(line) {
            Some(key) => keys.push(key),
            None => warn!("Skipping unparseable authorized_keys line {}", lineno + 1),
        }
    }
    keys
}

/// Accepts `type base64 [comment]`, optionally preceded by key options.
fn parse_entry(line: &str) -> Option<PublicKey> {
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Some(key);
    }
    let start = line
        .match_indices(char::is_whitespace)
        .map(|(idx, _)| idx + 1)
        .find(|&idx| {
            let rest = &line[idx..];
            rest.starts_with("ssh-") || rest.starts_with("ecdsa-") || rest.starts_with("sk-")
        })?;
    PublicKey::from_openssh(&line[start..]).ok()
}

/// First of `~/.ssh/id_ed25519`, `id_ecdsa`, `id_rsa` that exists.
pub fn default_identity() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
}

pub fn load_identity(path: &Path) -> Result<PrivateKey, TransportError> {
    russh::keys::load_secret_key(path, None)
        .map_err(|e| TransportError::Auth(format!("failed to load identity {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openssh_public() -> (PublicKey, String) {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let public = key.public_key().clone();
        let line = public.to_openssh().unwrap();
        (public, line)
    }

    #[test]
    fn parses_plain_and_optioned_entries() {
        let (a, a_line) = openssh_public();
        let (b, b_line) = openssh_public();
        let content = format!(
            "# team keys\n{} alice@laptop\n\nno-pty,command=\"true\" {}\ngarbage line\n",
            a_line, b_line
        );
        let keys = parse_authorized_keys(&content);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_data(), a.key_data());
        assert_eq!(keys[1].key_data(), b.key_data());
    }

    #[tokio::test]
    async fn host_key_is_generated_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys").join("host");
        let first = load_or_generate_host_key(&path).await.unwrap();
        let second = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(first.public_key().key_data(), second.public_key().key_data());
    }
}
