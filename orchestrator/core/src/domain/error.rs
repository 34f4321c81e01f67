// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use crate::domain::bridge::BridgeError;
use crate::domain::runtime::RuntimeError;

/// Why a session ended without a container exit code.
///
/// Every variant ends one session with
/// [`ExitStatus::ORCHESTRATOR_FAILURE`](crate::domain::exit_status::ExitStatus::ORCHESTRATOR_FAILURE).
/// Listen failures are process-fatal and surface as `TransportError` instead;
/// a failure on one bridge connection only counts against that connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session setup failed: {0}")]
    SessionSetup(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("session cancelled by client disconnect")]
    Cancelled,
}

impl SessionError {
    /// Line written to the caller's stderr.
    pub fn user_message(&self) -> String {
        format!("sandshell: {}\r\n", self)
    }
}
