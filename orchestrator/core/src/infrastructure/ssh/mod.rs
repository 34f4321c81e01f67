// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SSH Transport Infrastructure
//!
//! Both ends of the remote-shell transport, built on `russh`:
//!
//! - [`server`]: the gateway (`sandshell serve`). Accepts connections, collects
//!   env/pty/window-change requests per channel and hands each shell or exec
//!   request to the [`SessionOrchestrator`](crate::application::session_orchestrator::SessionOrchestrator).
//! - [`client`]: the caller (`sandshell connect`). Opens one session channel,
//!   relays the local terminal and answers `sandshell-fs` sub-channels from its
//!   NFS export.
//! - [`channel`]: the [`SubChannelDialer`](crate::domain::bridge::SubChannelDialer)
//!   the gateway uses to reach the caller's export.

pub mod channel;
pub mod client;
pub mod keys;
pub mod server;
pub mod trust;

use thiserror::Error;

pub use channel::ChannelDialer;
pub use client::{run_client, ClientIo, ClientOptions};
pub use server::{run_server, ServerState};
pub use trust::{AcceptAny, HostKeyPolicy, KnownHosts, RejectAll};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("host key error: {0}")]
    HostKey(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        TransportError::Channel(e.to_string())
    }
}
