// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod container_lifecycle;
pub mod fs_bridge;
pub mod resize_manager;
pub mod session_orchestrator;

pub use container_lifecycle::{ContainerLifecycle, ManagedContainer, StdioRelay};
pub use fs_bridge::bridge_from_config;
pub use resize_manager::{ResizeManager, ResizeStats};
pub use session_orchestrator::{SessionIo, SessionOrchestrator, SessionOutcome};
