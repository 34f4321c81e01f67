// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ordered release of per-session resources.
//!
//! Every acquisition pushes its release action immediately. [`CleanupStack::run`]
//! consumes the stack and awaits the actions newest-first, so each one runs at
//! most once. A stack dropped without `run` (a panicking or aborted task) hands
//! the remaining actions to the current Tokio runtime instead of leaking them.

use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

type CleanupAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct CleanupStack {
    scope: String,
    actions: Vec<(&'static str, CleanupAction)>,
}

impl CleanupStack {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            actions: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, label: &'static str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(scope = %self.scope, action = label, "Registered cleanup action");
        self.actions.push((label, Box::pin(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.actions.iter().rev().map(|(label, _)| *label).collect()
    }

    /// Run every action in reverse acquisition order. Returns how many ran.
    pub async fn run(mut self) -> usize {
        let mut ran = 0;
        while let Some((label, action)) = self.actions.pop() {
            debug!(scope = %self.scope, action = label, "Running cleanup action");
            action.await;
            ran += 1;
        }
        ran
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        let actions = std::mem::take(&mut self.actions);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    scope = %self.scope,
                    pending = actions.len(),
                    "Cleanup stack dropped before running, releasing in background"
                );
                handle.spawn(async move {
                    for (_, action) in actions.into_iter().rev() {
                        action.await;
                    }
                });
            }
            Err(_) => {
                warn!(
                    scope = %self.scope,
                    pending = actions.len(),
                    "Cleanup stack dropped outside a runtime, actions abandoned"
                );
            }
        }
    }
}
