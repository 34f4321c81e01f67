// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Metric names and recording helpers.
//!
//! Recording is a no-op until the binary installs a recorder (the Prometheus
//! exporter in `sandshell serve`).

use metrics::{counter, gauge};

use crate::domain::bridge::BridgeTransport;

pub const SESSIONS_TOTAL: &str = "sandshell_sessions_total";
pub const SESSION_FAILURES_TOTAL: &str = "sandshell_session_failures_total";
pub const CONTAINERS_CREATED_TOTAL: &str = "sandshell_containers_created_total";
pub const CONTAINERS_REMOVED_TOTAL: &str = "sandshell_containers_removed_total";
pub const BRIDGE_CONNECTIONS_TOTAL: &str = "sandshell_bridge_connections_total";
pub const ACTIVE_SESSIONS: &str = "sandshell_active_sessions";

pub fn session_started(tty: bool) {
    counter!(SESSIONS_TOTAL, "tty" => tty.to_string()).increment(1);
    gauge!(ACTIVE_SESSIONS).increment(1.0);
}

pub fn session_finished(failed: bool) {
    gauge!(ACTIVE_SESSIONS).decrement(1.0);
    if failed {
        counter!(SESSION_FAILURES_TOTAL).increment(1);
    }
}

pub fn container_created() {
    counter!(CONTAINERS_CREATED_TOTAL).increment(1);
}

pub fn container_removed(forced: bool) {
    counter!(CONTAINERS_REMOVED_TOTAL, "forced" => forced.to_string()).increment(1);
}

pub fn bridge_connection(transport: BridgeTransport) {
    counter!(BRIDGE_CONNECTIONS_TOTAL, "transport" => transport.to_string()).increment(1);
}
