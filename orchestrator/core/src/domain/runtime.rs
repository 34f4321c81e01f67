// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::container::{ContainerId, ContainerSpec, ContainerStdio, VolumeSpec};
use crate::domain::resize::TerminalGeometry;

/// Container runtime port.
///
/// Every call maps to one daemon request. `wait` blocks until the main
/// process exits and yields its raw exit code.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Must be called before `start` so no early output is lost.
    async fn attach(&self, id: &ContainerId) -> Result<ContainerStdio, RuntimeError>;

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn resize(&self, id: &ContainerId, geometry: TerminalGeometry) -> Result<(), RuntimeError>;

    async fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError>;

    /// Removing a container that is already gone is not an error.
    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container create rejected: {0}")]
    CreateRejected(String),

    #[error("container attach rejected: {0}")]
    AttachRejected(String),

    #[error("container start rejected: {0}")]
    StartRejected(String),

    #[error("container resize rejected: {0}")]
    ResizeRejected(String),

    #[error("waiting for container failed: {0}")]
    WaitFailed(String),

    #[error("container removal failed: {0}")]
    RemoveFailed(String),

    #[error("volume operation rejected: {0}")]
    VolumeRejected(String),

    #[error("container output stream failed: {0}")]
    StreamFailed(String),

    #[error("runtime call '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: std::time::Duration,
    },
}
