// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Session Orchestrator
//!
//! Top-level state machine for one shell or exec request:
//!
//! ```text
//! open bridge → create volumes → create → attach → register wait → start
//!   → relay stdio + resize → wait → drain output → report status → cleanup
//! ```
//!
//! Every acquisition pushes its release onto the session's [`CleanupStack`],
//! which runs newest-first on every exit path before the outcome is returned.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Sequences bridge, container, stdio and resize per session

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::container_lifecycle::{
    BoxedReader, BoxedWriter, ContainerLifecycle, SessionStreams, StdioRelay,
};
use crate::application::fs_bridge::bridge_from_config;
use crate::application::resize_manager::ResizeManager;
use crate::domain::bridge::{BridgeEndpoint, FilesystemBridge, SubChannelDialer};
use crate::domain::cleanup::CleanupStack;
use crate::domain::container::ContainerSpec;
use crate::domain::error::SessionError;
use crate::domain::exit_status::ExitStatus;
use crate::domain::resize::ResizeEvent;
use crate::domain::runtime::{ContainerRuntime, RuntimeError};
use crate::domain::server_config::ServerConfigSpec;
use crate::domain::session::Session;
use crate::infrastructure::metrics;

pub const SESSION_LABEL: &str = "sandshell.session";
pub const USER_LABEL: &str = "sandshell.user";
/// Caller-side directory the session's tree comes from.
pub const CWD_LABEL: &str = "sandshell.cwd";

/// The interactive party's streams.
pub struct SessionIo {
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    /// Receives the exit status as soon as it is known, before cleanup runs
    pub status: Option<oneshot::Sender<ExitStatus>>,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub status: ExitStatus,
    pub error: Option<SessionError>,
    /// Cleanup actions that ran before the outcome was returned
    pub released: usize,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub image: String,
    pub shell: String,
    pub working_dir: String,
    pub container_path: String,
    pub network_mode: Option<String>,
    pub drain_timeout: Duration,
    pub resize_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(spec: &ServerConfigSpec) -> Self {
        Self {
            image: spec.container.image.clone(),
            shell: spec.container.shell.clone(),
            working_dir: spec.container.working_dir.clone(),
            container_path: spec.bridge.container_path.clone(),
            network_mode: spec.container.network_mode.clone(),
            drain_timeout: spec.timeouts.drain,
            resize_timeout: spec.timeouts.resize,
        }
    }
}

pub struct SessionOrchestrator {
    lifecycle: ContainerLifecycle,
    resize: Arc<ResizeManager>,
    bridge: Arc<dyn FilesystemBridge>,
    settings: OrchestratorSettings,
}

/// Stream ownership moves into the relay once the container runs and comes
/// back (stderr only) when it finishes.
struct StreamSlots {
    stdin: Option<BoxedReader>,
    stdout: Option<BoxedWriter>,
    stderr: Option<BoxedWriter>,
    relay: Option<StdioRelay>,
}

impl SessionOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        bridge: Arc<dyn FilesystemBridge>,
        call_timeout: Duration,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            lifecycle: ContainerLifecycle::new(runtime.clone(), call_timeout),
            resize: Arc::new(ResizeManager::new(runtime, settings.resize_timeout)),
            bridge,
            settings,
        }
    }

    /// Wire the runtime to the bridge strategy and defaults in `spec`.
    pub fn from_config(spec: &ServerConfigSpec, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::new(
            runtime,
            bridge_from_config(&spec.bridge),
            spec.timeouts.runtime_call,
            OrchestratorSettings::from_config(spec),
        )
    }

    /// Container spec for `session` with `endpoint` mounted at the container path.
    pub fn container_spec(&self, session: &Session, endpoint: &BridgeEndpoint) -> ContainerSpec {
        let mut command = vec![self.settings.shell.clone()];
        if let Some(cmd) = &session.command {
            command.push("-c".to_string());
            command.push(cmd.clone());
        }

        let mut spec = ContainerSpec::new(self.settings.image.clone(), command);
        spec.name = Some(format!("sandshell-{}", session.id.short()));
        spec.env = session.environ();
        spec.tty = session.is_tty();
        spec.working_dir = Some(self.settings.working_dir.clone());
        spec.console_size = session.initial_geometry();
        spec.network_mode = self.settings.network_mode.clone();
        spec.labels = HashMap::from([
            (SESSION_LABEL.to_string(), session.id.to_string()),
            (USER_LABEL.to_string(), session.user.clone()),
            (CWD_LABEL.to_string(), session.working_dir_hint().to_string()),
        ]);
        endpoint.apply(&mut spec, &self.settings.container_path);
        spec
    }

    /// Run one session to completion.
    ///
    /// Never fails: setup and runtime errors are written to the session's
    /// stderr and reported as [`ExitStatus::ORCHESTRATOR_FAILURE`]. The status
    /// goes to `io.status` before the cleanup stack runs. Cancelling
    /// `cancel` (client gone) unwinds the session and force-removes the
    /// container.
    pub async fn run(
        &self,
        session: Session,
        io: SessionIo,
        dialer: Arc<dyn SubChannelDialer>,
        resize: Option<watch::Receiver<ResizeEvent>>,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let label = session.id.short();
        metrics::session_started(session.is_tty());
        let mut cleanup = CleanupStack::new(format!("session {}", label));
        let status_tx = io.status;
        let mut slots = StreamSlots {
            stdin: Some(io.stdin),
            stdout: Some(io.stdout),
            stderr: Some(io.stderr),
            relay: None,
        };

        let result = self
            .drive(&session, &mut slots, dialer, resize, &cancel, &mut cleanup)
            .await;

        if let Some(relay) = slots.relay.take() {
            let (report, stderr) = match &result {
                Ok(_) => relay.finish(self.settings.drain_timeout).await,
                Err(_) => relay.close().await,
            };
            debug!(
                "[{}] stdio closed: in={} out={} err={}",
                label, report.stdin_bytes, report.stdout_bytes, report.stderr_bytes
            );
            if let Some(e) = report.error {
                warn!("[{}] stdio relay: {}", label, e);
            }
            slots.stderr = stderr;
        }

        let (status, error) = match result {
            Ok(code) => (ExitStatus::from_container_code(code), None),
            Err(e) => {
                match &e {
                    SessionError::Cancelled => info!("[{}] session cancelled", label),
                    other => {
                        warn!("[{}] session failed: {}", label, other);
                        if let Some(stderr) = slots.stderr.as_mut() {
                            let _ = stderr.write_all(other.user_message().as_bytes()).await;
                            let _ = stderr.flush().await;
                        }
                    }
                }
                (ExitStatus::ORCHESTRATOR_FAILURE, Some(e))
            }
        };
        drop(slots);

        if let Some(tx) = status_tx {
            if tx.send(status).is_err() {
                debug!("[{}] nobody waiting for the exit status", label);
            }
        }
        let released = cleanup.run().await;
        metrics::session_finished(error.is_some());
        info!(
            "[{}] session finished with status {} ({} resources released)",
            label, status, released
        );

        SessionOutcome {
            status,
            error,
            released,
        }
    }

    async fn drive(
        &self,
        session: &Session,
        slots: &mut StreamSlots,
        dialer: Arc<dyn SubChannelDialer>,
        resize: Option<watch::Receiver<ResizeEvent>>,
        cancel: &CancellationToken,
        cleanup: &mut CleanupStack,
    ) -> Result<i64, SessionError> {
        let label = session.id.short();

        info!(
            "[{}] exposing {} at {} via {}",
            label,
            session.working_dir_hint(),
            self.settings.container_path,
            self.bridge.transport()
        );
        let bridge = self.bridge.open(session, dialer).await?;
        let endpoint = bridge.endpoint().clone();
        cleanup.push("shut down bridge", async move {
            let report = bridge.shutdown().await;
            debug!(
                "Bridge served {} connections ({} failed)",
                report.connections, report.failed_connections
            );
        });
        debug!("[{}] bridge ready: {:?}", label, endpoint);
        ensure_live(cancel)?;

        let spec = self.container_spec(session, &endpoint);
        self.lifecycle.prepare_volumes(&spec, cleanup).await?;
        let container = self.lifecycle.create(&spec, cleanup).await?;
        let stdio = self.lifecycle.attach(&container).await?;
        ensure_live(cancel)?;

        let mut wait = self.lifecycle.begin_wait(&container).await;
        if let Err(e) = self.lifecycle.start(&container).await {
            wait.abort();
            return Err(e.into());
        }

        let streams = match (slots.stdin.take(), slots.stdout.take(), slots.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => SessionStreams {
                stdin,
                stdout,
                stderr,
            },
            _ => {
                wait.abort();
                return Err(SessionError::SessionSetup(
                    "session streams already in use".to_string(),
                ));
            }
        };
        slots.relay = Some(StdioRelay::spawn(stdio, streams, cancel));

        let resize_stop = cancel.child_token();
        let resize_task = match (resize, session.initial_geometry()) {
            (Some(feed), Some(initial)) if container.tty => {
                let manager = self.resize.clone();
                let id = container.id.clone();
                let stop = resize_stop.clone();
                Some(tokio::spawn(async move {
                    manager.run(id, initial, feed, stop).await
                }))
            }
            _ => None,
        };

        let waited = tokio::select! {
            _ = cancel.cancelled() => {
                wait.abort();
                None
            }
            joined = &mut wait => Some(joined),
        };

        resize_stop.cancel();
        if let Some(task) = resize_task {
            if let Ok(stats) = task.await {
                debug!("[{}] resize: {:?}", label, stats);
            }
        }

        let result = match waited {
            None => return Err(SessionError::Cancelled),
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(RuntimeError::WaitFailed(e.to_string())),
        };
        self.lifecycle.finish(&container, &result);
        Ok(result?)
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), SessionError> {
    if cancel.is_cancelled() {
        Err(SessionError::Cancelled)
    } else {
        Ok(())
    }
}
