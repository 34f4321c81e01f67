// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal geometry and the last-writer-wins resize feed.
//!
//! The SSH layer pushes every `window-change` into a [`ResizeFeed`]. Only the
//! most recent geometry is retained, so a slow runtime never accumulates a
//! backlog of stale sizes.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TerminalGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalGeometry {
    /// Build from SSH wire values, saturating at `u16::MAX`.
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.min(u16::MAX as u32) as u16,
            rows: rows.min(u16::MAX as u32) as u16,
        }
    }

    /// Clients send 0x0 when they have no size; never forwarded.
    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResizeEvent {
    pub seq: u64,
    pub geometry: TerminalGeometry,
}

pub struct ResizeFeed {
    tx: watch::Sender<ResizeEvent>,
}

impl ResizeFeed {
    pub fn new(initial: TerminalGeometry) -> Self {
        let (tx, _rx) = watch::channel(ResizeEvent {
            seq: 0,
            geometry: initial,
        });
        Self { tx }
    }

    /// Record a geometry change, superseding any value not yet applied.
    pub fn push(&self, geometry: TerminalGeometry) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|event| {
            event.seq += 1;
            event.geometry = geometry;
            seq = event.seq;
        });
        seq
    }

    pub fn subscribe(&self) -> watch::Receiver<ResizeEvent> {
        self.tx.subscribe()
    }
}
