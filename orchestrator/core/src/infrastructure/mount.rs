// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host-side NFS mounts for the loopback-mount bridge.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::bridge::BridgeError;

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount the NFS export at `server` onto `target`, creating `target`.
    async fn mount(&self, server: SocketAddr, target: &Path) -> Result<(), BridgeError>;

    /// Unmount `target` and remove the directory.
    async fn unmount(&self, target: &Path) -> Result<(), BridgeError>;
}

/// Shells out to `mount(8)` / `umount(8)`. Requires CAP_SYS_ADMIN.
pub struct CommandMounter {
    extra_options: Option<String>,
}

impl CommandMounter {
    pub fn new(extra_options: Option<String>) -> Self {
        Self { extra_options }
    }

    fn options(&self, port: u16) -> String {
        let mut options = format!(
            "port={},mountport={},nfsvers=3,proto=tcp,nolock,soft,timeo=10",
            port, port
        );
        if let Some(extra) = self.extra_options.as_deref().filter(|o| !o.is_empty()) {
            options.push(',');
            options.push_str(extra);
        }
        options
    }

    async fn run(program: &str, args: &[String]) -> Result<(), String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()));
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for CommandMounter {
    async fn mount(&self, server: SocketAddr, target: &Path) -> Result<(), BridgeError> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| BridgeError::Mount(format!("cannot create {}: {}", target.display(), e)))?;

        let args = vec![
            "-t".to_string(),
            "nfs".to_string(),
            "-o".to_string(),
            self.options(server.port()),
            format!("{}:/", server.ip()),
            target.display().to_string(),
        ];
        if let Err(e) = Self::run("mount", &args).await {
            let _ = tokio::fs::remove_dir(target).await;
            return Err(BridgeError::Mount(e));
        }
        info!("Mounted {} on {}", server, target.display());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), BridgeError> {
        let mut args = vec![target.display().to_string()];
        if let Err(e) = Self::run("umount", &args).await {
            warn!("Clean unmount of {} failed, retrying lazily: {}", target.display(), e);
            args.insert(0, "-l".to_string());
            Self::run("umount", &args).await.map_err(BridgeError::Unmount)?;
        }
        tokio::fs::remove_dir(target)
            .await
            .map_err(|e| BridgeError::Unmount(format!("cannot remove {}: {}", target.display(), e)))?;
        info!("Unmounted {}", target.display());
        Ok(())
    }
}

/// Per-session mount point under `root`.
pub fn session_mount_point(root: &Path, session: &str) -> PathBuf {
    root.join(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_include_port_for_mount_protocol() {
        let mounter = CommandMounter::new(Some("ro".to_string()));
        assert_eq!(
            mounter.options(2049),
            "port=2049,mountport=2049,nfsvers=3,proto=tcp,nolock,soft,timeo=10,ro"
        );
        assert!(!CommandMounter::new(None).options(1).ends_with(','));
    }
}
