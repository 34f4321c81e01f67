// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Filesystem bridge ports
//!
//! A bridge makes the caller's working directory reachable from the session's
//! container. The producer (the `sandshell connect` side) serves the directory;
//! the consumer (the gateway) reaches it only through sub-channels of the SSH
//! connection, dialed via [`SubChannelDialer`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Transport selection, endpoint descriptors and bridge traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::container::{ContainerMount, ContainerSpec, VolumeSpec};
use crate::domain::session::Session;

/// Address carried by every filesystem sub-channel. The producer refuses
/// forwarded channels addressed to anything else.
pub const FS_CHANNEL_ADDRESS: &str = "sandshell-fs";

/// Environment variable pointing at the bridge socket inside the container.
pub const FS_SOCKET_ENV: &str = "SANDSHELL_FS_SOCKET";

/// Default NFS client options for volumes backed by a dedicated listener.
pub const NFS_VOLUME_OPTIONS: &str = "nfsvers=3,proto=tcp,nolock,soft,timeo=10";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeTransport {
    /// Unix socket and host NFS mount, each connection tunneled
    TunneledChannel,
    /// TCP listener consumed by the Docker NFS volume driver
    #[default]
    DedicatedListener,
    /// Host-side NFS mount bind-mounted into the container
    LoopbackMount,
}

impl fmt::Display for BridgeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TunneledChannel => "tunneled-channel",
            Self::DedicatedListener => "dedicated-listener",
            Self::LoopbackMount => "loopback-mount",
        };
        f.write_str(name)
    }
}

impl FromStr for BridgeTransport {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunneled-channel" | "tunneled" => Ok(Self::TunneledChannel),
            "dedicated-listener" | "dedicated" => Ok(Self::DedicatedListener),
            "loopback-mount" | "loopback" => Ok(Self::LoopbackMount),
            other => Err(BridgeError::UnknownTransport(other.to_string())),
        }
    }
}

/// What the container needs in order to reach an open bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEndpoint {
    /// Socket directory for in-container clients plus a host mount of the
    /// same tunnel
    Socket {
        host_dir: PathBuf,
        socket_name: String,
        container_dir: String,
        mount_dir: PathBuf,
    },
    Nfs {
        volume: String,
        host: String,
        port: u16,
        extra_options: Option<String>,
    },
    HostPath { path: PathBuf },
}

impl BridgeEndpoint {
    /// Wire this endpoint into a container spec so the caller's tree appears at
    /// `container_path`.
    pub fn apply(&self, spec: &mut ContainerSpec, container_path: &str) {
        match self {
            Self::Socket {
                host_dir,
                socket_name,
                container_dir,
                mount_dir,
            } => {
                spec.mounts.push(ContainerMount::Bind {
                    source: mount_dir.clone(),
                    target: container_path.to_string(),
                    read_only: false,
                });
                spec.mounts.push(ContainerMount::Bind {
                    source: host_dir.clone(),
                    target: container_dir.clone(),
                    read_only: false,
                });
                spec.env.push(format!(
                    "{}={}/{}",
                    FS_SOCKET_ENV,
                    container_dir.trim_end_matches('/'),
                    socket_name
                ));
            }
            Self::Nfs {
                volume,
                host,
                port,
                extra_options,
            } => {
                let mut options = format!(
                    "addr={},port={},mountport={},{}",
                    host, port, port, NFS_VOLUME_OPTIONS
                );
                if let Some(extra) = extra_options.as_deref().filter(|o| !o.is_empty()) {
                    options.push(',');
                    options.push_str(extra);
                }
                spec.volumes.push(VolumeSpec {
                    name: volume.clone(),
                    driver: "local".to_string(),
                    driver_opts: HashMap::from([
                        ("type".to_string(), "nfs".to_string()),
                        ("o".to_string(), options),
                        ("device".to_string(), ":/".to_string()),
                    ]),
                    labels: spec.labels.clone(),
                });
                spec.mounts.push(ContainerMount::Volume {
                    name: volume.clone(),
                    target: container_path.to_string(),
                });
            }
            Self::HostPath { path } => {
                spec.mounts.push(ContainerMount::Bind {
                    source: path.clone(),
                    target: container_path.to_string(),
                    read_only: false,
                });
            }
        }
    }
}

/// Byte stream usable in both directions.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedDuplex = Pin<Box<dyn DuplexStream>>;

/// Opens filesystem sub-channels back to the producer of a session.
#[async_trait]
pub trait SubChannelDialer: Send + Sync {
    async fn open_fs_channel(&self, originator: Option<SocketAddr>) -> Result<BoxedDuplex, BridgeError>;
}

/// Strategy that opens one bridge per session.
#[async_trait]
pub trait FilesystemBridge: Send + Sync {
    fn transport(&self) -> BridgeTransport;

    /// Ready to accept connections once this returns.
    async fn open(
        &self,
        session: &Session,
        dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError>;
}

#[async_trait]
pub trait ActiveBridge: Send {
    fn endpoint(&self) -> &BridgeEndpoint;

    /// Stop accepting, release host resources, then close in-flight pipes.
    async fn shutdown(self: Box<Self>) -> BridgeReport;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub connections: u64,
    pub failed_connections: u64,
    pub released: bool,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind bridge listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open filesystem sub-channel: {0}")]
    ChannelOpen(String),

    #[error("failed to mount bridge: {0}")]
    Mount(String),

    #[error("failed to unmount bridge: {0}")]
    Unmount(String),

    #[error("unknown bridge transport '{0}'")]
    UnknownTransport(String),

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}
