// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container model
//!
//! A session owns exactly one container. Its lifecycle is tracked as
//! [`ContainerState`]; [`ContainerState::can_transition_to`] encodes the allowed
//! moves, with `Errored` reachable from every non-terminal state.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Container specification, lifecycle states and stdio handles

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use crate::domain::resize::TerminalGeometry;
use crate::domain::runtime::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.0.len() > 12 { &self.0[..12] } else { &self.0 };
        write!(f, "{}", short)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Attached,
    Started,
    Running,
    Exited,
    Removed,
    Errored,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Errored)
    }

    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        match (self, next) {
            (Created, Attached) => true,
            (Attached, Started) => true,
            (Started, Running) => true,
            (Running, Exited) => true,
            (Exited, Removed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Whether a container in this state still has to be deleted explicitly.
    /// An exited container only removes itself when created with `auto_remove`.
    pub fn needs_removal(&self, auto_remove: bool) -> bool {
        match self {
            Self::Removed => false,
            Self::Exited => !auto_remove,
            _ => true,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Attached => "attached",
            Self::Started => "started",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Removed => "removed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerMount {
    Bind {
        source: PathBuf,
        target: String,
        read_only: bool,
    },
    /// Named volume created beforehand through [`VolumeSpec`]
    Volume { name: String, target: String },
}

impl ContainerMount {
    pub fn target(&self) -> &str {
        match self {
            Self::Bind { target, .. } | Self::Volume { target, .. } => target,
        }
    }
}

/// Driver-backed volume created before the container and removed after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: String,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub working_dir: Option<String>,
    pub mounts: Vec<ContainerMount>,
    pub volumes: Vec<VolumeSpec>,
    pub console_size: Option<TerminalGeometry>,
    pub auto_remove: bool,
    pub network_mode: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: None,
            image: image.into(),
            command,
            env: Vec::new(),
            tty: false,
            working_dir: None,
            mounts: Vec::new(),
            volumes: Vec::new(),
            console_size: None,
            auto_remove: true,
            network_mode: None,
            labels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Attached stdio of a container that has not necessarily started yet.
pub struct ContainerStdio {
    pub output: BoxStream<'static, Result<ContainerOutput, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl fmt::Debug for ContainerStdio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerStdio").finish_non_exhaustive()
    }
}
