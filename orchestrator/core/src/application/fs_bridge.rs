// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Filesystem Bridge Strategies
//!
//! Three interchangeable ways of letting a session's container reach the
//! caller's NFS export. All of them accept local connections and pipe each one
//! into a fresh `sandshell-fs` sub-channel; they differ only in where the
//! listener lives and how the container is pointed at it.
//!
//! | Transport            | Listener                      | Container sees                    |
//! |----------------------|-------------------------------|-----------------------------------|
//! | `tunneled-channel`   | unix socket in `socket_root`  | socket directory and host NFS     |
//! |                      | and TCP on `127.0.0.1:0`      | mount, both bind-mounted          |
//! | `dedicated-listener` | TCP on `listen_host:0`        | Docker `local` NFS volume         |
//! | `loopback-mount`     | TCP on `127.0.0.1:0`          | host NFS mount, bind-mounted      |
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements the `FilesystemBridge` port for every transport

use async_trait::async_trait;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::bridge::{
    ActiveBridge, BoxedDuplex, BridgeEndpoint, BridgeError, BridgeReport, BridgeTransport,
    FilesystemBridge, SubChannelDialer,
};
use crate::domain::server_config::BridgeConfig;
use crate::domain::session::Session;
use crate::infrastructure::metrics;
use crate::infrastructure::mount::{session_mount_point, CommandMounter, Mounter};
use crate::infrastructure::stream_pipe::StreamPipe;

/// File name of the bridge socket inside its per-session directory.
pub const SOCKET_NAME: &str = "fs.sock";

/// Where the socket directory appears inside the container.
pub const CONTAINER_SOCKET_DIR: &str = "/run/sandshell";

const SOCKET_DIR_MODE: u32 = 0o700;

/// Build the strategy selected by `config.transport`.
pub fn bridge_from_config(config: &BridgeConfig) -> Arc<dyn FilesystemBridge> {
    match config.transport {
        BridgeTransport::TunneledChannel => Arc::new(TunneledChannelBridge::new(
            config.socket_root.clone(),
            config.mount_root.clone(),
            Arc::new(CommandMounter::new(config.nfs_mount_options.clone())),
        )),
        BridgeTransport::DedicatedListener => Arc::new(DedicatedListenerBridge::new(
            config.listen_host.clone(),
            config.advertised_host(),
            config.nfs_mount_options.clone(),
        )),
        BridgeTransport::LoopbackMount => Arc::new(LoopbackMountBridge::new(
            config.mount_root.clone(),
            Arc::new(CommandMounter::new(config.nfs_mount_options.clone())),
        )),
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(BoxedDuplex, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::pin(stream), Some(peer)))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::pin(stream), None))
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    failed: AtomicU64,
}

/// What must be undone on the host once accepting stops.
enum Release {
    SocketDir(PathBuf),
    Mount {
        mounter: Arc<dyn Mounter>,
        target: PathBuf,
    },
}

impl Release {
    async fn run(self) -> bool {
        match self {
            Release::SocketDir(dir) => match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    warn!("Failed to remove bridge socket dir {}: {}", dir.display(), e);
                    false
                }
            },
            Release::Mount { mounter, target } => match mounter.unmount(&target).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}", e);
                    false
                }
            },
        }
    }
}

/// Accepts local connections and pipes each one into a new sub-channel.
struct AcceptLoop {
    transport: BridgeTransport,
    stop: CancellationToken,
    pipes: CancellationToken,
    counters: Arc<Counters>,
    tasks: Vec<JoinHandle<JoinSet<()>>>,
}

impl AcceptLoop {
    fn spawn(
        transport: BridgeTransport,
        listeners: Vec<Listener>,
        dialer: Arc<dyn SubChannelDialer>,
        session_label: String,
    ) -> Self {
        let stop = CancellationToken::new();
        let pipes = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let tasks = listeners
            .into_iter()
            .map(|listener| {
                let stop = stop.clone();
                let pipes = pipes.clone();
                let counters = counters.clone();
                let dialer = dialer.clone();
                let session_label = session_label.clone();
                tokio::spawn(async move {
                    let mut connections = JoinSet::new();
                    loop {
                        let accepted = tokio::select! {
                            _ = stop.cancelled() => break,
                            accepted = listener.accept() => accepted,
                        };
                        // Reap finished connections so the set stays small.
                        while connections.try_join_next().is_some() {}

                        let (stream, originator) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("[{}] bridge accept failed: {}", session_label, e);
                                continue;
                            }
                        };
                        counters.connections.fetch_add(1, Ordering::Relaxed);
                        metrics::bridge_connection(transport);
                        debug!("[{}] bridge connection from {:?}", session_label, originator);

                        let dialer = dialer.clone();
                        let counters = counters.clone();
                        let pipe = StreamPipe::scoped(&pipes);
                        let label = session_label.clone();
                        connections.spawn(async move {
                            serve_connection(label, stream, originator, dialer, pipe, counters)
                                .await;
                        });
                    }
                    connections
                })
            })
            .collect();

        Self {
            transport,
            stop,
            pipes,
            counters,
            tasks,
        }
    }

    /// Stop accepting, run `releases` in order, then close in-flight pipes.
    async fn shutdown(self, releases: Vec<Release>) -> BridgeReport {
        self.stop.cancel();
        let mut connections = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.await {
                Ok(set) => connections.push(set),
                Err(e) => warn!("Bridge accept loop panicked: {}", e),
            }
        }

        let mut released = true;
        for release in releases {
            released &= release.run().await;
        }

        self.pipes.cancel();
        for mut set in connections {
            while set.join_next().await.is_some() {}
        }

        let report = BridgeReport {
            connections: self.counters.connections.load(Ordering::Relaxed),
            failed_connections: self.counters.failed.load(Ordering::Relaxed),
            released,
        };
        debug!("{} bridge closed: {:?}", self.transport, report);
        report
    }
}

async fn serve_connection(
    label: String,
    stream: BoxedDuplex,
    originator: Option<SocketAddr>,
    dialer: Arc<dyn SubChannelDialer>,
    pipe: StreamPipe,
    counters: Arc<Counters>,
) {
    let channel = match dialer.open_fs_channel(originator).await {
        Ok(channel) => channel,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("[{}] {}", label, e);
            return;
        }
    };
    let report = pipe.relay(stream, channel).await;
    if let Some(e) = report.error {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!("[{}] bridge connection failed: {}", label, e);
    }
}

struct BridgeHandle {
    endpoint: BridgeEndpoint,
    accept: AcceptLoop,
    releases: Vec<Release>,
}

#[async_trait]
impl ActiveBridge for BridgeHandle {
    fn endpoint(&self) -> &BridgeEndpoint {
        &self.endpoint
    }

    async fn shutdown(self: Box<Self>) -> BridgeReport {
        let this = *self;
        this.accept.shutdown(this.releases).await
    }
}

async fn bind_tcp(host: &str) -> Result<TcpListener, BridgeError> {
    let addr = format!("{}:0", host);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BridgeError::Bind { addr, source })
}

/// Per-session socket directory readable only by the gateway user.
async fn create_socket_dir(dir: &Path) -> Result<(), BridgeError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(SOCKET_DIR_MODE);
    builder.create(dir).await?;
    // `mode` is ignored for directories that already existed.
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(SOCKET_DIR_MODE)).await?;
    Ok(())
}

/// Unix socket per session plus a host NFS mount of the same tunnel, both
/// bind-mounted into the container.
pub struct TunneledChannelBridge {
    socket_root: PathBuf,
    mount_root: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl TunneledChannelBridge {
    pub fn new(socket_root: PathBuf, mount_root: PathBuf, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            socket_root,
            mount_root,
            mounter,
        }
    }
}

#[async_trait]
impl FilesystemBridge for TunneledChannelBridge {
    fn transport(&self) -> BridgeTransport {
        BridgeTransport::TunneledChannel
    }

    async fn open(
        &self,
        session: &Session,
        dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError> {
        let dir = self.socket_root.join(session.id.to_string());
        create_socket_dir(&dir).await?;
        let path = dir.join(SOCKET_NAME);
        let socket = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(source) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(BridgeError::Bind {
                    addr: path.display().to_string(),
                    source,
                });
            }
        };
        let loopback = match bind_tcp("127.0.0.1").await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };
        let server = loopback.local_addr()?;
        info!("[{}] bridge socket at {}", session.id.short(), path.display());

        let accept = AcceptLoop::spawn(
            self.transport(),
            vec![Listener::Unix(socket), Listener::Tcp(loopback)],
            dialer,
            session.id.short(),
        );

        let target = session_mount_point(&self.mount_root, &session.id.to_string());
        if let Err(e) = self.mounter.mount(server, &target).await {
            accept.shutdown(vec![Release::SocketDir(dir)]).await;
            return Err(e);
        }

        Ok(Box::new(BridgeHandle {
            endpoint: BridgeEndpoint::Socket {
                host_dir: dir.clone(),
                socket_name: SOCKET_NAME.to_string(),
                container_dir: CONTAINER_SOCKET_DIR.to_string(),
                mount_dir: target.clone(),
            },
            accept,
            releases: vec![
                Release::Mount {
                    mounter: self.mounter.clone(),
                    target,
                },
                Release::SocketDir(dir),
            ],
        }))
    }
}

/// TCP port consumed by Docker's `local` volume driver with `type=nfs`.
pub struct DedicatedListenerBridge {
    listen_host: String,
    advertise_host: String,
    extra_options: Option<String>,
}

impl DedicatedListenerBridge {
    pub fn new(listen_host: String, advertise_host: String, extra_options: Option<String>) -> Self {
        Self {
            listen_host,
            advertise_host,
            extra_options,
        }
    }
}

#[async_trait]
impl FilesystemBridge for DedicatedListenerBridge {
    fn transport(&self) -> BridgeTransport {
        BridgeTransport::DedicatedListener
    }

    async fn open(
        &self,
        session: &Session,
        dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError> {
        let listener = bind_tcp(&self.listen_host).await?;
        let port = listener.local_addr()?.port();
        info!(
            "[{}] bridge listening on {}:{} (advertised as {})",
            session.id.short(),
            self.listen_host,
            port,
            self.advertise_host
        );

        Ok(Box::new(BridgeHandle {
            endpoint: BridgeEndpoint::Nfs {
                volume: format!("sandshell-{}", session.id.short()),
                host: self.advertise_host.clone(),
                port,
                extra_options: self.extra_options.clone(),
            },
            accept: AcceptLoop::spawn(
                self.transport(),
                vec![Listener::Tcp(listener)],
                dialer,
                session.id.short(),
            ),
            releases: Vec::new(),
        }))
    }
}

/// NFS mount on the host, bind-mounted into the container.
pub struct LoopbackMountBridge {
    mount_root: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl LoopbackMountBridge {
    pub fn new(mount_root: PathBuf, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            mount_root,
            mounter,
        }
    }
}

#[async_trait]
impl FilesystemBridge for LoopbackMountBridge {
    fn transport(&self) -> BridgeTransport {
        BridgeTransport::LoopbackMount
    }

    async fn open(
        &self,
        session: &Session,
        dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError> {
        let listener = bind_tcp("127.0.0.1").await?;
        let server = listener.local_addr()?;

        // mount(8) connects immediately, so the loop must already be accepting.
        let accept = AcceptLoop::spawn(
            self.transport(),
            vec![Listener::Tcp(listener)],
            dialer,
            session.id.short(),
        );

        let target = session_mount_point(&self.mount_root, &session.id.to_string());
        if let Err(e) = self.mounter.mount(server, &target).await {
            accept.shutdown(Vec::new()).await;
            return Err(e);
        }

        Ok(Box::new(BridgeHandle {
            endpoint: BridgeEndpoint::HostPath {
                path: target.clone(),
            },
            accept,
            releases: vec![Release::Mount {
                mounter: self.mounter.clone(),
                target,
            }],
        }))
    }
}
