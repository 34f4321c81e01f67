// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::fmt;

/// Status reported to the interactive party when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(u8);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    /// Reserved for failures before or around the container's own exit.
    pub const ORCHESTRATOR_FAILURE: ExitStatus = ExitStatus(255);

    /// Codes outside 0..=255 cannot be represented by a process and map to 255.
    pub fn from_container_code(code: i64) -> Self {
        u8::try_from(code)
            .map(ExitStatus)
            .unwrap_or(Self::ORCHESTRATOR_FAILURE)
    }

    pub fn code(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
