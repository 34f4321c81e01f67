// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Container Lifecycle Manager
//!
//! Drives one container per session through
//! `Created → Attached → Started → Running → Exited → Removed`, bounding every
//! runtime call except `wait` by the configured timeout. Acquisitions register
//! their release on the caller's [`CleanupStack`] as soon as they succeed.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Container state machine and stdio relay

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::cleanup::CleanupStack;
use crate::domain::container::{
    ContainerId, ContainerOutput, ContainerSpec, ContainerState, ContainerStdio,
};
use crate::domain::runtime::{ContainerRuntime, RuntimeError};
use crate::infrastructure::metrics;
use crate::infrastructure::stream_pipe::{copy_direction, KeepOpen, PipeCloser, StreamPipe};

/// Volume removal races Docker's auto-remove of the container using it.
const VOLUME_REMOVE_ATTEMPTS: u32 = 5;
const VOLUME_REMOVE_BACKOFF: Duration = Duration::from_millis(200);

/// Handle to a created container and its observed state.
#[derive(Clone)]
pub struct ManagedContainer {
    pub id: ContainerId,
    pub tty: bool,
    auto_remove: bool,
    state: Arc<Mutex<ContainerState>>,
}

impl ManagedContainer {
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// Apply `next` if the state machine allows it. Returns whether it did.
    pub fn advance(&self, next: ContainerState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!("Container {}: {} -> {}", self.id, *state, next);
            *state = next;
            true
        } else {
            debug!("Container {}: ignoring {} -> {}", self.id, *state, next);
            false
        }
    }

    fn needs_removal(&self) -> bool {
        self.state().needs_removal(self.auto_remove)
    }
}

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    call_timeout: Duration,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, call_timeout: Duration) -> Self {
        Self {
            runtime,
            call_timeout,
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        bounded(self.call_timeout, operation, call).await
    }

    /// Create the driver volumes `spec` references.
    pub async fn prepare_volumes(
        &self,
        spec: &ContainerSpec,
        cleanup: &mut CleanupStack,
    ) -> Result<(), RuntimeError> {
        for volume in &spec.volumes {
            self.bounded("create_volume", self.runtime.create_volume(volume))
                .await?;
            debug!("Created volume {} ({})", volume.name, volume.driver);

            let runtime = self.runtime.clone();
            let name = volume.name.clone();
            let timeout = self.call_timeout;
            cleanup.push("remove volume", async move {
                remove_volume_with_retry(runtime, name, timeout).await;
            });
        }
        Ok(())
    }

    /// Create the container. On success, a removal action is registered that
    /// force-removes it unless it already exited under auto-remove.
    pub async fn create(
        &self,
        spec: &ContainerSpec,
        cleanup: &mut CleanupStack,
    ) -> Result<ManagedContainer, RuntimeError> {
        let id = self.bounded("create", self.runtime.create(spec)).await?;
        metrics::container_created();
        info!("Created container {} from {}", id, spec.image);

        let container = ManagedContainer {
            id,
            tty: spec.tty,
            auto_remove: spec.auto_remove,
            state: Arc::new(Mutex::new(ContainerState::Created)),
        };

        let runtime = self.runtime.clone();
        let handle = container.clone();
        let timeout = self.call_timeout;
        cleanup.push("remove container", async move {
            if !handle.needs_removal() {
                debug!("Container {} removed itself", handle.id);
                metrics::container_removed(false);
                return;
            }
            match bounded(timeout, "remove", runtime.remove(&handle.id, true)).await {
                Ok(()) => {
                    metrics::container_removed(true);
                    *handle.state.lock() = ContainerState::Removed;
                    info!("Force-removed container {}", handle.id);
                }
                Err(e) => warn!("Failed to remove container {}: {}", handle.id, e),
            }
        });

        Ok(container)
    }

    pub async fn attach(&self, container: &ManagedContainer) -> Result<ContainerStdio, RuntimeError> {
        match self
            .bounded("attach", self.runtime.attach(&container.id))
            .await
        {
            Ok(stdio) => {
                container.advance(ContainerState::Attached);
                Ok(stdio)
            }
            Err(e) => {
                container.advance(ContainerState::Errored);
                Err(e)
            }
        }
    }

    /// Register interest in the container's exit. Call before [`start`](Self::start)
    /// so a fast exit followed by auto-removal is still observed.
    pub async fn begin_wait(&self, container: &ManagedContainer) -> JoinHandle<Result<i64, RuntimeError>> {
        let runtime = self.runtime.clone();
        let id = container.id.clone();
        let handle = tokio::spawn(async move { runtime.wait(&id).await });
        tokio::task::yield_now().await;
        handle
    }

    /// Start the container. A successful start is taken as the runtime's
    /// confirmation that it is running.
    pub async fn start(&self, container: &ManagedContainer) -> Result<(), RuntimeError> {
        match self.bounded("start", self.runtime.start(&container.id)).await {
            Ok(()) => {
                container.advance(ContainerState::Started);
                container.advance(ContainerState::Running);
                info!("Started container {}", container.id);
                Ok(())
            }
            Err(e) => {
                container.advance(ContainerState::Errored);
                Err(e)
            }
        }
    }

    /// Record the outcome of the wait registered by [`begin_wait`](Self::begin_wait).
    pub fn finish(&self, container: &ManagedContainer, result: &Result<i64, RuntimeError>) {
        match result {
            Ok(code) => {
                container.advance(ContainerState::Exited);
                info!("Container {} exited with {}", container.id, code);
            }
            Err(e) => {
                container.advance(ContainerState::Errored);
                warn!("Lost track of container {}: {}", container.id, e);
            }
        }
    }
}

async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}

async fn remove_volume_with_retry(runtime: Arc<dyn ContainerRuntime>, name: String, timeout: Duration) {
    for attempt in 1..=VOLUME_REMOVE_ATTEMPTS {
        match bounded(timeout, "remove_volume", runtime.remove_volume(&name)).await {
            Ok(()) => {
                debug!("Removed volume {}", name);
                return;
            }
            Err(e) if attempt < VOLUME_REMOVE_ATTEMPTS => {
                debug!("Volume {} not removable yet (attempt {}): {}", name, attempt, e);
                tokio::time::sleep(VOLUME_REMOVE_BACKOFF * attempt).await;
            }
            Err(e) => warn!("Failed to remove volume {}: {}", name, e),
        }
    }
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Session side of the container's stdio.
pub struct SessionStreams {
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
}

#[derive(Debug, Default)]
pub struct StdioReport {
    pub stdin_bytes: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// First failure that was not a peer closing its end
    pub error: Option<String>,
}

/// Both stdio directions of one container, run as one [`StreamPipe`].
///
/// Forward is the caller's stdin into the container; backward is the
/// container's stdout. Stderr frames are split off the attach stream and
/// copied beside the pipe. Output ends when the attach stream ends (container
/// exited); the pipe then stops the input direction, which may still be
/// parked on the caller's stdin. The session's stderr is handed back when the
/// relay finishes so late errors can still be reported.
pub struct StdioRelay {
    task: JoinHandle<(StdioReport, BoxedWriter)>,
    closer: PipeCloser,
}

impl StdioRelay {
    pub fn spawn(stdio: ContainerStdio, streams: SessionStreams, session: &CancellationToken) -> Self {
        let pipe = StreamPipe::scoped(session).ending_with_backward();
        let closer = pipe.closer();
        let task = {
            let closer = closer.clone();
            tokio::spawn(async move {
                let ContainerStdio { output, input } = stdio;
                let SessionStreams {
                    stdin,
                    stdout,
                    mut stderr,
                } = streams;
                let (stdout_frames, stderr_frames) = split_output(output);
                let mut stderr_reader = StreamReader::new(stderr_frames);

                let stderr_direction = async {
                    let mut stderr_writer = KeepOpen(&mut stderr);
                    tokio::select! {
                        outcome = copy_direction(&mut stderr_reader, &mut stderr_writer) => Some(outcome),
                        _ = closer.closed() => None,
                    }
                };
                let (pipe_report, stderr_outcome) = tokio::join!(
                    pipe.join(
                        (stdin, input),
                        (StreamReader::new(stdout_frames), KeepOpen(stdout)),
                    ),
                    stderr_direction,
                );

                let mut report = StdioReport {
                    stdin_bytes: pipe_report.forward_bytes.unwrap_or(0),
                    stdout_bytes: pipe_report.backward_bytes.unwrap_or(0),
                    error: pipe_report.error.map(|e| e.to_string()),
                    ..Default::default()
                };
                if let Some(outcome) = stderr_outcome {
                    report.stderr_bytes = outcome.bytes;
                    if let (Some(e), None) = (outcome.error, &report.error) {
                        report.error = Some(format!("stderr: {}", e));
                    }
                }
                (report, stderr)
            })
        };
        Self { task, closer }
    }

    /// Let output drain for at most `drain`, then close both directions.
    pub async fn finish(mut self, drain: Duration) -> (StdioReport, Option<BoxedWriter>) {
        match tokio::time::timeout(drain, &mut self.task).await {
            Ok(joined) => unpack(joined),
            Err(_) => {
                debug!("Output still open after {:?}, closing", drain);
                self.close().await
            }
        }
    }

    /// Close both directions immediately.
    pub async fn close(self) -> (StdioReport, Option<BoxedWriter>) {
        self.closer.close();
        unpack(self.task.await)
    }
}

fn unpack(
    joined: Result<(StdioReport, BoxedWriter), tokio::task::JoinError>,
) -> (StdioReport, Option<BoxedWriter>) {
    match joined {
        Ok((report, stderr)) => (report, Some(stderr)),
        Err(e) => (
            StdioReport {
                error: Some(format!("stdio relay failed: {}", e)),
                ..Default::default()
            },
            None,
        ),
    }
}

type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Split the attach stream into stdout and stderr byte streams. A runtime
/// error ends stdout with that error.
fn split_output(output: BoxStream<'static, Result<ContainerOutput, RuntimeError>>) -> (ByteStream, ByteStream) {
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
    let stdout = output
        .filter_map(move |frame| {
            let routed = match frame {
                Ok(ContainerOutput::Stdout(bytes)) => Some(Ok(bytes)),
                Ok(ContainerOutput::Stderr(bytes)) => {
                    let _ = stderr_tx.send(bytes);
                    None
                }
                Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
            };
            futures::future::ready(routed)
        })
        .boxed();
    let stderr = futures::stream::unfold(stderr_rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok(bytes), rx))
    })
    .boxed();
    (stdout, stderr)
}
