// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory collaborators for orchestrator tests.
//!
//! `ScriptedRuntime` understands a handful of commands:
//! - `sh -c "exit N"` exits with N
//! - `sh -c ls` lists the directory bind-mounted at `/local`
//! - `sh -c "echo TEXT"` prints TEXT on stdout
//! - anything else runs until [`ScriptedRuntime::exit_all`] is called

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use sandshell_core::application::session_orchestrator::{
    OrchestratorSettings, SessionIo, SessionOrchestrator,
};
use sandshell_core::domain::bridge::{
    ActiveBridge, BoxedDuplex, BridgeEndpoint, BridgeError, BridgeReport, BridgeTransport,
    FilesystemBridge, SubChannelDialer,
};
use sandshell_core::domain::container::{
    ContainerId, ContainerMount, ContainerOutput, ContainerSpec, ContainerStdio, VolumeSpec,
};
use sandshell_core::domain::resize::TerminalGeometry;
use sandshell_core::domain::runtime::{ContainerRuntime, RuntimeError};
use sandshell_core::domain::session::Session;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, watch};

pub const CONTAINER_PATH: &str = "/local";

#[derive(Default, Clone, Copy)]
pub struct Faults {
    pub fail_create: bool,
    pub fail_attach: bool,
    pub fail_start: bool,
    /// `wait` errors out as if the daemon connection dropped
    pub fail_wait: bool,
}

struct FakeContainer {
    spec: ContainerSpec,
    output: Option<mpsc::UnboundedSender<ContainerOutput>>,
    exit: watch::Sender<Option<i64>>,
    removed: bool,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    faults: Faults,
    next_id: AtomicUsize,
    containers: Mutex<HashMap<String, FakeContainer>>,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    pub force_removed: AtomicUsize,
    pub volumes: Mutex<Vec<String>>,
    pub removed_volumes: Mutex<Vec<String>>,
    pub resizes: Mutex<Vec<TerminalGeometry>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
}

impl ScriptedRuntime {
    pub fn new(faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            faults,
            ..Default::default()
        })
    }

    pub fn running(&self) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|c| !c.removed && c.exit.borrow().is_none())
            .count()
    }

    /// Make every running container exit with `code`.
    pub fn exit_all(&self, code: i64) {
        let mut containers = self.containers.lock();
        for container in containers.values_mut() {
            if !container.removed && container.exit.borrow().is_none() {
                container.output = None;
                self.auto_remove(container);
                let _ = container.exit.send_replace(Some(code));
            }
        }
    }

    fn auto_remove(&self, container: &mut FakeContainer) {
        if container.spec.auto_remove && !container.removed {
            container.removed = true;
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn script(spec: &ContainerSpec) -> Option<(Vec<u8>, i64)> {
        let command = spec.command.get(2)?;
        if let Some(code) = command.strip_prefix("exit ") {
            return Some((Vec::new(), code.trim().parse().unwrap_or(255)));
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Some((format!("{}\n", text).into_bytes(), 0));
        }
        if command == "ls" {
            let source = spec.mounts.iter().find_map(|m| match m {
                ContainerMount::Bind { source, target, .. } if target == CONTAINER_PATH => {
                    Some(source.clone())
                }
                _ => None,
            })?;
            let mut names: Vec<String> = std::fs::read_dir(source)
                .ok()?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            let mut out = names.join("\n");
            out.push('\n');
            return Some((out.into_bytes(), 0));
        }
        None
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        if self.faults.fail_create {
            return Err(RuntimeError::CreateRejected("no such image".to_string()));
        }
        let id = format!("c{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (exit, _) = watch::channel(None);
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                output: None,
                exit,
                removed: false,
            },
        );
        self.specs.lock().push(spec.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerId(id))
    }

    async fn attach(&self, id: &ContainerId) -> Result<ContainerStdio, RuntimeError> {
        if self.faults.fail_attach {
            return Err(RuntimeError::AttachRejected("attach refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(id.as_str())
            .ok_or_else(|| RuntimeError::AttachRejected("no such container".to_string()))?;
        container.output = Some(tx);

        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        })
        .boxed();
        let (input, mut sink) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = sink.read_to_end(&mut buf).await;
        });
        Ok(ContainerStdio {
            output,
            input: Box::pin(input),
        })
    }

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        if self.faults.fail_start {
            return Err(RuntimeError::StartRejected("exec format error".to_string()));
        }
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(id.as_str())
            .ok_or_else(|| RuntimeError::StartRejected("no such container".to_string()))?;

        if let Some((stdout, code)) = Self::script(&container.spec) {
            if let Some(output) = container.output.take() {
                if !stdout.is_empty() {
                    let _ = output.send(ContainerOutput::Stdout(Bytes::from(stdout)));
                }
            }
            self.auto_remove(container);
            let _ = container.exit.send_replace(Some(code));
        }
        Ok(())
    }

    async fn resize(&self, _id: &ContainerId, geometry: TerminalGeometry) -> Result<(), RuntimeError> {
        self.resizes.lock().push(geometry);
        Ok(())
    }

    async fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError> {
        if self.faults.fail_wait {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(RuntimeError::WaitFailed("daemon connection lost".to_string()));
        }
        let mut rx = {
            let containers = self.containers.lock();
            containers
                .get(id.as_str())
                .ok_or_else(|| RuntimeError::WaitFailed("no such container".to_string()))?
                .exit
                .subscribe()
        };
        let code = *rx
            .wait_for(|code| code.is_some())
            .await
            .map_err(|e| RuntimeError::WaitFailed(e.to_string()))?;
        Ok(code.unwrap_or(255))
    }

    async fn remove(&self, id: &ContainerId, _force: bool) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        if let Some(container) = containers.get_mut(id.as_str()) {
            if !container.removed {
                container.removed = true;
                container.output = None;
                self.removed.fetch_add(1, Ordering::SeqCst);
                self.force_removed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError> {
        self.volumes.lock().push(spec.name.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.removed_volumes.lock().push(name.to_string());
        Ok(())
    }
}

/// Bridge with a fixed endpoint that records its lifecycle.
pub struct FixedBridge {
    endpoint: BridgeEndpoint,
    pub opened: Arc<AtomicUsize>,
    pub shut_down: Arc<AtomicUsize>,
}

impl FixedBridge {
    pub fn host_path(dir: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_endpoint(BridgeEndpoint::HostPath { path: dir.into() })
    }

    pub fn with_endpoint(endpoint: BridgeEndpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            opened: Arc::new(AtomicUsize::new(0)),
            shut_down: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.shut_down.load(Ordering::SeqCst)
    }
}

struct FixedActive {
    endpoint: BridgeEndpoint,
    shut_down: Arc<AtomicUsize>,
}

#[async_trait]
impl ActiveBridge for FixedActive {
    fn endpoint(&self) -> &BridgeEndpoint {
        &self.endpoint
    }

    async fn shutdown(self: Box<Self>) -> BridgeReport {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
        BridgeReport {
            released: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl FilesystemBridge for FixedBridge {
    fn transport(&self) -> BridgeTransport {
        BridgeTransport::LoopbackMount
    }

    async fn open(
        &self,
        _session: &Session,
        _dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixedActive {
            endpoint: self.endpoint.clone(),
            shut_down: self.shut_down.clone(),
        }))
    }
}

/// Bridge whose shutdown blocks until [`GatedBridge::release`] is called.
pub struct GatedBridge {
    path: PathBuf,
    gate: Arc<tokio::sync::Notify>,
    pub shut_down: Arc<AtomicUsize>,
}

impl GatedBridge {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: dir.into(),
            gate: Arc::new(tokio::sync::Notify::new()),
            shut_down: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

struct GatedActive {
    endpoint: BridgeEndpoint,
    gate: Arc<tokio::sync::Notify>,
    shut_down: Arc<AtomicUsize>,
}

#[async_trait]
impl ActiveBridge for GatedActive {
    fn endpoint(&self) -> &BridgeEndpoint {
        &self.endpoint
    }

    async fn shutdown(self: Box<Self>) -> BridgeReport {
        self.gate.notified().await;
        self.shut_down.fetch_add(1, Ordering::SeqCst);
        BridgeReport {
            released: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl FilesystemBridge for GatedBridge {
    fn transport(&self) -> BridgeTransport {
        BridgeTransport::LoopbackMount
    }

    async fn open(
        &self,
        _session: &Session,
        _dialer: Arc<dyn SubChannelDialer>,
    ) -> Result<Box<dyn ActiveBridge>, BridgeError> {
        Ok(Box::new(GatedActive {
            endpoint: BridgeEndpoint::HostPath {
                path: self.path.clone(),
            },
            gate: self.gate.clone(),
            shut_down: self.shut_down.clone(),
        }))
    }
}

pub struct NoDialer;

#[async_trait]
impl SubChannelDialer for NoDialer {
    async fn open_fs_channel(&self, _originator: Option<SocketAddr>) -> Result<BoxedDuplex, BridgeError> {
        Err(BridgeError::ChannelOpen("no transport in tests".to_string()))
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        image: "alpine".to_string(),
        shell: "sh".to_string(),
        working_dir: CONTAINER_PATH.to_string(),
        container_path: CONTAINER_PATH.to_string(),
        network_mode: None,
        drain_timeout: Duration::from_secs(1),
        resize_timeout: Duration::from_secs(1),
    }
}

pub fn orchestrator(runtime: Arc<ScriptedRuntime>, bridge: Arc<dyn FilesystemBridge>) -> SessionOrchestrator {
    SessionOrchestrator::new(runtime, bridge, Duration::from_secs(5), settings())
}

/// Caller-side ends of a session's streams.
pub struct Terminal {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

impl Terminal {
    pub async fn read_stdout(&mut self) -> String {
        let mut out = String::new();
        let _ = self.stdout.read_to_string(&mut out).await;
        out
    }

    pub async fn read_stderr(&mut self) -> String {
        let mut out = String::new();
        let _ = self.stderr.read_to_string(&mut out).await;
        out
    }
}

pub fn session_io() -> (SessionIo, Terminal) {
    let (stdin_caller, stdin_session) = tokio::io::duplex(4096);
    let (stdout_session, stdout_caller) = tokio::io::duplex(64 * 1024);
    let (stderr_session, stderr_caller) = tokio::io::duplex(64 * 1024);
    (
        SessionIo {
            stdin: Box::pin(stdin_session),
            stdout: Box::pin(stdout_session),
            stderr: Box::pin(stderr_session),
            status: None,
        },
        Terminal {
            stdin: stdin_caller,
            stdout: stdout_caller,
            stderr: stderr_caller,
        },
    )
}
