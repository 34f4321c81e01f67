// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model
//!
//! Sessions, containers, bridge endpoints and the traits infrastructure adapters
//! implement.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types, state machines, errors and ports

pub mod bridge;
pub mod cleanup;
pub mod container;
pub mod error;
pub mod exit_status;
pub mod path_sanitizer;
pub mod resize;
pub mod runtime;
pub mod server_config;
pub mod session;
