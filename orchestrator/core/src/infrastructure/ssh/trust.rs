// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host key trust policies for the connecting side.

use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use std::path::PathBuf;
use tracing::{error, warn};

/// Decides, once per connection, whether a server's host key is trusted.
pub trait HostKeyPolicy: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool;
}

/// Trusts every key. Only for throwaway environments.
pub struct AcceptAny;

impl HostKeyPolicy for AcceptAny {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        warn!(
            "Accepting host key {} for {}:{} without verification (insecure)",
            key.fingerprint(HashAlg::Sha256),
            host,
            port
        );
        true
    }
}

pub struct RejectAll;

impl HostKeyPolicy for RejectAll {
    fn verify(&self, host: &str, port: u16, _key: &PublicKey) -> bool {
        warn!("Rejecting host key for {}:{} by policy", host, port);
        false
    }
}

/// Verifies against an OpenSSH `known_hosts` file.
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts`
    pub fn user_default() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".ssh").join("known_hosts")))
    }
}

impl HostKeyPolicy for KnownHosts {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match russh::keys::check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    "Host key {} for {}:{} is not in {}",
                    key.fingerprint(HashAlg::Sha256),
                    host,
                    port,
                    self.path.display()
                );
                false
            }
            Err(e) => {
                error!(
                    "Host key verification for {}:{} against {} failed: {}",
                    host,
                    port,
                    self.path.display(),
                    e
                );
                false
            }
        }
    }
}
