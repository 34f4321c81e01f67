// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Adapters for the outside world: Docker, the SSH transport, the NFS export of
//! the caller's directory, host mounts and metrics.

pub mod metrics;
pub mod mount;
pub mod nfs;
pub mod runtime;
pub mod ssh;
pub mod stream_pipe;

pub use runtime::DockerRuntime;
pub use stream_pipe::{PipeReport, StreamPipe};
