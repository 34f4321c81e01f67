// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Gateway side of the SSH transport.
//!
//! Each connection gets a [`ConnectionHandler`]. Session channels accumulate
//! env, pty and window-change requests in a per-channel slot; a shell or exec
//! request consumes the slot and runs one session on its own task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::ChannelDialer;
use super::TransportError;
use crate::application::session_orchestrator::{SessionIo, SessionOrchestrator};
use crate::domain::resize::{ResizeFeed, TerminalGeometry};
use crate::domain::session::{PtyRequest, Session as ShellSession};

/// Shared by every connection.
pub struct ServerState {
    pub orchestrator: Arc<SessionOrchestrator>,
    /// `None` accepts any presented key.
    pub authorized_keys: Option<Vec<PublicKey>>,
}

impl ServerState {
    fn is_authorized(&self, key: &PublicKey) -> bool {
        match &self.authorized_keys {
            None => true,
            Some(keys) => keys.iter().any(|k| k.key_data() == key.key_data()),
        }
    }
}

/// Requests collected on a session channel before shell/exec.
struct ChannelSlot {
    channel: Option<Channel<Msg>>,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    resize: Option<ResizeFeed>,
    cancel: CancellationToken,
}

pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: SocketAddr,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelSlot>,
    /// Parent of every session token on this connection.
    connection: CancellationToken,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            user: None,
            channels: HashMap::new(),
            connection: CancellationToken::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Turn the slot for `channel_id` into a running session.
    fn launch(&mut self, channel_id: ChannelId, command: Option<String>, session: &mut Session) {
        let user = self.user.clone().unwrap_or_default();
        let Some(slot) = self.channels.get_mut(&channel_id) else {
            warn!("Shell/exec request on unknown channel {:?}", channel_id);
            let _ = session.channel_failure(channel_id);
            return;
        };
        let Some(channel) = slot.channel.take() else {
            warn!("Channel {:?} already runs a session", channel_id);
            let _ = session.channel_failure(channel_id);
            return;
        };

        let mut shell = ShellSession::new(user);
        shell.env = slot.env.clone();
        if let Some(pty) = slot.pty.clone() {
            shell = shell.with_pty(pty);
        }
        if let Some(command) = command {
            shell = shell.with_command(command);
        }
        let resize_rx = slot.resize.as_ref().map(ResizeFeed::subscribe);
        let cancel = slot.cancel.clone();

        let _ = session.channel_success(channel_id);
        info!(
            "Session {} for {} from {} on channel {:?} ({})",
            shell.id.short(),
            shell.user,
            self.peer_addr,
            channel_id,
            shell.command.as_deref().unwrap_or("interactive shell")
        );

        let handle = session.handle();
        let stderr = channel.make_writer_ext(Some(1));
        let (stdin, stdout) = tokio::io::split(channel.into_stream());
        let (status_tx, status_rx) = oneshot::channel();
        let io = SessionIo {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            status: Some(status_tx),
        };
        let dialer = Arc::new(ChannelDialer::new(handle.clone(), self.peer_addr));
        let orchestrator = self.server.orchestrator.clone();

        tokio::spawn(async move {
            // The status goes out while the session is still cleaning up;
            // EOF and close follow once cleanup is done.
            let report = {
                let handle = handle.clone();
                async move {
                    if let Ok(status) = status_rx.await {
                        let _ = handle.exit_status_request(channel_id, status.code()).await;
                    }
                }
            };
            let (outcome, ()) = tokio::join!(
                orchestrator.run(shell, io, dialer, resize_rx, cancel),
                report
            );
            debug!("Channel {:?} finished with status {}", channel_id, outcome.status);
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Connection gone: unwind every session still running on it.
        self.connection.cancel();
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.server.is_authorized(public_key) {
            Ok(Auth::Accept)
        } else {
            debug!("Key offered by '{}' from {} is not authorized", user, self.peer_addr);
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if !self.server.is_authorized(public_key) {
            warn!("Rejected public key for '{}' from {}", user, self.peer_addr);
            return Ok(Self::reject());
        }
        info!("Authenticated '{}' from {}", user, self.peer_addr);
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        self.channels.insert(
            channel.id(),
            ChannelSlot {
                channel: Some(channel),
                env: Vec::new(),
                pty: None,
                resize: None,
                cancel: self.connection.child_token(),
            },
        );
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Env request on {:?}: {}", channel_id, variable_name);
        if let Some(slot) = self.channels.get_mut(&channel_id) {
            slot.env
                .push((variable_name.to_string(), variable_value.to_string()));
            let _ = session.channel_success(channel_id);
        } else {
            let _ = session.channel_failure(channel_id);
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: term={}, cols={}, rows={}",
            term, col_width, row_height
        );
        let Some(slot) = self.channels.get_mut(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let geometry = TerminalGeometry::new(col_width, row_height);
        slot.pty = Some(PtyRequest {
            term: term.to_string(),
            geometry,
        });
        slot.resize = Some(ResizeFeed::new(geometry));
        let _ = session.channel_success(channel_id);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.launch(channel_id, None, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        self.launch(channel_id, Some(command), session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let feed = self
            .channels
            .get(&channel_id)
            .and_then(|slot| slot.resize.as_ref());
        match feed {
            Some(feed) => {
                let seq = feed.push(TerminalGeometry::new(col_width, row_height));
                debug!(
                    "Window change #{} on {:?}: {}x{}",
                    seq, channel_id, col_width, row_height
                );
            }
            None => debug!("Ignoring window change on {:?} without a pty", channel_id),
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(slot) = self.channels.remove(&channel_id) {
            slot.cancel.cancel();
        }
        Ok(())
    }
}

/// Accept connections on `listen` until `shutdown` fires.
///
/// Bind failure is the only error that ends the process; per-connection
/// failures are logged.
pub async fn run_server(
    listen: &str,
    host_key: PrivateKey,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    });

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|source| TransportError::Listen {
            addr: listen.to_string(),
            source,
        })?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("SSH server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!("Connection from {}", peer_addr);
        let state = state.clone();
        let russh_config = russh_config.clone();
        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error from {}: {}", peer_addr, e);
                }
            }
            debug!("Connection from {} closed", peer_addr);
        });
    }
}
