// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::resize::TerminalGeometry;

/// Environment key carrying the caller's working directory.
pub const WORKING_DIR_ENV: &str = "CWD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used for container and volume names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pseudo-terminal requested by the interactive party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub geometry: TerminalGeometry,
}

/// One shell or exec request on an SSH channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    /// Absent for an interactive shell
    pub command: Option<String>,
    pub pty: Option<PtyRequest>,
    pub env: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            user: user.into(),
            command: None,
            pty: None,
            env: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = Some(pty);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn is_tty(&self) -> bool {
        self.pty.is_some()
    }

    pub fn initial_geometry(&self) -> Option<TerminalGeometry> {
        self.pty.as_ref().map(|pty| pty.geometry)
    }

    /// Latest value of `key`; later env requests override earlier ones.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Directory the caller asked to expose, `/` when not supplied.
    pub fn working_dir_hint(&self) -> &str {
        self.env_var(WORKING_DIR_ENV)
            .filter(|v| !v.is_empty())
            .unwrap_or("/")
    }

    /// Container environment in `KEY=VALUE` form.
    pub fn environ(&self) -> Vec<String> {
        let mut environ: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if let Some(pty) = &self.pty {
            if self.env_var("TERM").is_none() {
                environ.push(format!("TERM={}", pty.term));
            }
        }
        environ
    }
}
