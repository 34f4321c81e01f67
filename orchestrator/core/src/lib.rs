// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! sandshell core
//!
//! Turns an authenticated SSH session into a disposable container whose mounted
//! working directory is served, through the same connection, from the caller's
//! machine.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Session bridge and container lifecycle orchestration

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
