// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Caller side of the SSH transport.
//!
//! Opens one session channel on the gateway, relays the local terminal over it
//! and answers the gateway's `sandshell-fs` sub-channels by piping each one to
//! the local NFS export.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use russh::client::{self, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::trust::HostKeyPolicy;
use super::TransportError;
use crate::domain::bridge::FS_CHANNEL_ADDRESS;
use crate::domain::exit_status::ExitStatus;
use crate::domain::resize::TerminalGeometry;
use crate::domain::session::WORKING_DIR_ENV;
use crate::infrastructure::stream_pipe::StreamPipe;

pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: PrivateKey,
    pub policy: Arc<dyn HostKeyPolicy>,
    /// `None` requests a PTY and an interactive shell
    pub command: Option<String>,
    pub term: String,
    pub working_dir: String,
    /// Loopback address of the local NFS export
    pub export_addr: SocketAddr,
}

pub struct ClientIo {
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    pub stdout: Pin<Box<dyn AsyncWrite + Send>>,
    pub stderr: Pin<Box<dyn AsyncWrite + Send>>,
    /// Current local terminal size; required for an interactive shell.
    pub geometry: Option<watch::Receiver<TerminalGeometry>>,
}

struct ProducerHandler {
    host: String,
    port: u16,
    policy: Arc<dyn HostKeyPolicy>,
    export_addr: SocketAddr,
    /// Closes every sub-channel pipe when the connection goes away.
    connection: CancellationToken,
}

impl Drop for ProducerHandler {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

impl client::Handler for ProducerHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.policy.verify(&self.host, self.port, server_public_key))
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if connected_address != FS_CHANNEL_ADDRESS {
            warn!(
                "Refusing forwarded channel to '{}' from {}:{}",
                connected_address, originator_address, originator_port
            );
            let _ = channel.close().await;
            return Ok(());
        }

        debug!(
            "Filesystem sub-channel for {}:{}",
            originator_address, originator_port
        );
        let export_addr = self.export_addr;
        let pipe = StreamPipe::scoped(&self.connection);
        tokio::spawn(async move {
            let export = match TcpStream::connect(export_addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot reach local export at {}: {}", export_addr, e);
                    let _ = channel.close().await;
                    return;
                }
            };
            let report = pipe.relay(channel.into_stream(), export).await;
            match report.error {
                Some(e) => warn!("Filesystem sub-channel ended with error: {}", e),
                None => debug!(
                    "Filesystem sub-channel closed ({:?} bytes in, {:?} out)",
                    report.forward_bytes, report.backward_bytes
                ),
            }
        });
        Ok(())
    }
}

/// Resolves with the next geometry, or never when there is no terminal.
async fn next_geometry(rx: &mut Option<watch::Receiver<TerminalGeometry>>) -> Option<TerminalGeometry> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Run one remote session and return its exit status.
///
/// A channel that closes without reporting an exit status yields
/// [`ExitStatus::ORCHESTRATOR_FAILURE`].
pub async fn run_client(options: ClientOptions, mut io: ClientIo) -> Result<u32, TransportError> {
    let config = Arc::new(client::Config::default());
    let handler = ProducerHandler {
        host: options.host.clone(),
        port: options.port,
        policy: options.policy.clone(),
        export_addr: options.export_addr,
        connection: CancellationToken::new(),
    };

    info!("Connecting to {}:{}", options.host, options.port);
    let mut handle = client::connect(config, (options.host.as_str(), options.port), handler)
        .await
        .map_err(|e| TransportError::Connect(format!("{}:{}: {}", options.host, options.port, e)))?;

    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let auth = handle
        .authenticate_publickey(
            options.user.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(options.identity), hash_alg),
        )
        .await?;
    if !auth.success() {
        return Err(TransportError::Auth(format!(
            "public key rejected for '{}'",
            options.user
        )));
    }

    let mut channel = handle.channel_open_session().await?;
    channel
        .set_env(false, WORKING_DIR_ENV, options.working_dir.as_str())
        .await?;

    match &options.command {
        Some(command) => {
            debug!("Exec: {}", command);
            channel.exec(true, command.as_str()).await?;
        }
        None => {
            let geometry = io
                .geometry
                .as_ref()
                .map(|rx| *rx.borrow())
                .unwrap_or(TerminalGeometry { cols: 80, rows: 24 });
            channel
                .request_pty(
                    false,
                    &options.term,
                    u32::from(geometry.cols),
                    u32::from(geometry.rows),
                    0,
                    0,
                    &[],
                )
                .await?;
            channel.request_shell(true).await?;
        }
    }

    let mut geometry_rx = if options.command.is_none() {
        io.geometry.take()
    } else {
        None
    };
    let mut stdin_open = true;
    let mut buf = vec![0u8; 8192];
    let mut exit_status: Option<u32> = None;

    loop {
        tokio::select! {
            read = io.stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) => {
                    stdin_open = false;
                    channel.eof().await?;
                }
                Ok(n) => channel.data(&buf[..n]).await?,
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    stdin_open = false;
                    channel.eof().await?;
                }
            },
            geometry = next_geometry(&mut geometry_rx) => match geometry {
                Some(g) if !g.is_empty() => {
                    channel
                        .window_change(u32::from(g.cols), u32::from(g.rows), 0, 0)
                        .await?;
                }
                Some(_) => {}
                None => geometry_rx = None,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    io.stdout.write_all(&data).await?;
                    io.stdout.flush().await?;
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    io.stderr.write_all(&data).await?;
                    io.stderr.flush().await?;
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    debug!("Remote exit status {}", code);
                    exit_status = Some(code);
                }
                Some(ChannelMsg::Failure) => {
                    warn!("Gateway refused the session request");
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;

    Ok(exit_status.unwrap_or_else(|| {
        warn!("Session closed without an exit status");
        ExitStatus::ORCHESTRATOR_FAILURE.code()
    }))
}
