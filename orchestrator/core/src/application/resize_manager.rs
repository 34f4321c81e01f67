// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Terminal Resize Manager
//!
//! Forwards window changes to a running TTY container. Geometry arrives on a
//! `watch` channel, so bursts collapse to the newest value; an apply still in
//! flight when a newer geometry arrives is dropped in favour of the newer one.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Coalesced, bounded delivery of resize events

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::container::ContainerId;
use crate::domain::resize::{ResizeEvent, TerminalGeometry};
use crate::domain::runtime::ContainerRuntime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeStats {
    pub applied: u64,
    /// Applies abandoned because a newer geometry arrived
    pub superseded: u64,
    pub failed: u64,
    /// Unchanged or empty geometries that never reached the runtime
    pub skipped: u64,
}

pub struct ResizeManager {
    runtime: Arc<dyn ContainerRuntime>,
    apply_timeout: Duration,
}

impl ResizeManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, apply_timeout: Duration) -> Self {
        Self {
            runtime,
            apply_timeout,
        }
    }

    /// Deliver geometry changes to `id` until `stop` fires or the feed closes.
    ///
    /// `initial` is the geometry the container was created with. Call only
    /// once the container is running and cancel `stop` when it leaves that
    /// state.
    pub async fn run(
        &self,
        id: ContainerId,
        initial: TerminalGeometry,
        mut feed: watch::Receiver<ResizeEvent>,
        stop: CancellationToken,
    ) -> ResizeStats {
        let mut stats = ResizeStats::default();
        let mut last = initial;
        let mut feed_open = true;

        // A change may have arrived between the pty request and start.
        let mut pending = Some(*feed.borrow_and_update());

        loop {
            let event = match pending.take() {
                Some(event) => event,
                None if !feed_open => break,
                None => tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    changed = feed.changed() => match changed {
                        Ok(()) => *feed.borrow_and_update(),
                        Err(_) => break,
                    },
                },
            };

            if event.geometry == last || event.geometry.is_empty() {
                stats.skipped += 1;
                continue;
            }

            let apply = tokio::time::timeout(self.apply_timeout, self.runtime.resize(&id, event.geometry));
            tokio::pin!(apply);

            let result = loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return stats,
                    changed = feed.changed(), if feed_open => match changed {
                        Ok(()) => break None,
                        Err(_) => feed_open = false,
                    },
                    result = &mut apply => break Some(result),
                }
            };

            match result {
                None => {
                    stats.superseded += 1;
                    debug!("Resize #{} to {}x{} superseded", event.seq, event.geometry.cols, event.geometry.rows);
                    pending = Some(*feed.borrow_and_update());
                }
                Some(Ok(Ok(()))) => {
                    stats.applied += 1;
                    last = event.geometry;
                    debug!("Resized {} to {}x{}", id, event.geometry.cols, event.geometry.rows);
                }
                Some(Ok(Err(e))) => {
                    stats.failed += 1;
                    warn!("Failed to resize {}: {}", id, e);
                }
                Some(Err(_)) => {
                    stats.failed += 1;
                    warn!("Resizing {} timed out after {:?}", id, self.apply_timeout);
                }
            }
        }

        stats
    }
}
