// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end session runs against an in-memory container runtime.
//!
//! These tests verify:
//! 1. Exit status fidelity and the 255 orchestrator-failure status
//! 2. Cleanup of the bridge and container on every failure path
//! 3. Client disconnect unwinding a running session
//! 4. Resize delivery while the container runs
//! 5. Isolation between concurrent sessions
//! 6. Exit status delivery ahead of cleanup

mod common;

use common::*;
use sandshell_core::application::session_orchestrator::CWD_LABEL;
use sandshell_core::domain::bridge::BridgeEndpoint;
use sandshell_core::domain::container::ContainerMount;
use sandshell_core::domain::error::SessionError;
use sandshell_core::domain::exit_status::ExitStatus;
use sandshell_core::domain::resize::{ResizeFeed, TerminalGeometry};
use sandshell_core::domain::runtime::RuntimeError;
use sandshell_core::domain::session::{PtyRequest, Session};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn command_session(command: &str) -> Session {
    Session::new("dev")
        .with_env("CWD", "/home/dev/project")
        .with_command(command)
}

#[tokio::test]
async fn exit_codes_are_reported_unchanged() {
    let runtime = ScriptedRuntime::new(Faults::default());
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = FixedBridge::host_path(dir.path());
    let orchestrator = orchestrator(runtime.clone(), bridge.clone());

    for code in [0u32, 1, 2, 130] {
        let (io, _terminal) = session_io();
        let outcome = orchestrator
            .run(
                command_session(&format!("exit {}", code)),
                io,
                Arc::new(NoDialer),
                None,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.status.code(), code);
        assert!(outcome.error.is_none());
    }

    assert_eq!(runtime.created.load(Ordering::SeqCst), 4);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 4);
    assert_eq!(runtime.force_removed.load(Ordering::SeqCst), 0);
    assert_eq!(bridge.open_count(), 0);
}

#[tokio::test]
async fn ls_sees_the_callers_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    let runtime = ScriptedRuntime::new(Faults::default());
    let orchestrator = orchestrator(runtime.clone(), FixedBridge::host_path(dir.path()));

    let (io, mut terminal) = session_io();
    let outcome = orchestrator
        .run(command_session("ls"), io, Arc::new(NoDialer), None, CancellationToken::new())
        .await;

    assert_eq!(outcome.status, ExitStatus::SUCCESS);
    assert!(terminal.read_stdout().await.contains("a.txt"));

    let spec = runtime.specs.lock()[0].clone();
    assert_eq!(spec.command, vec!["sh", "-c", "ls"]);
    assert!(!spec.tty);
    assert!(spec.auto_remove);
    assert_eq!(spec.working_dir.as_deref(), Some(CONTAINER_PATH));
    assert!(spec.env.contains(&"CWD=/home/dev/project".to_string()));
    assert_eq!(spec.labels[CWD_LABEL], "/home/dev/project");
}

#[tokio::test]
async fn create_failure_still_tears_down_the_bridge() {
    let runtime = ScriptedRuntime::new(Faults {
        fail_create: true,
        ..Default::default()
    });
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = FixedBridge::host_path(dir.path());
    let orchestrator = orchestrator(runtime.clone(), bridge.clone());

    let (io, mut terminal) = session_io();
    let outcome = orchestrator
        .run(command_session("exit 0"), io, Arc::new(NoDialer), None, CancellationToken::new())
        .await;

    assert_eq!(outcome.status, ExitStatus::ORCHESTRATOR_FAILURE);
    assert!(matches!(
        outcome.error,
        Some(SessionError::Runtime(RuntimeError::CreateRejected(_)))
    ));
    assert_eq!(bridge.opened.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.open_count(), 0);
    assert_eq!(runtime.created.load(Ordering::SeqCst), 0);

    let stderr = terminal.read_stderr().await;
    assert!(stderr.starts_with("sandshell: "), "stderr was {:?}", stderr);
    assert!(stderr.contains("no such image"));
}

#[tokio::test]
async fn failed_start_force_removes_the_container() {
    let runtime = ScriptedRuntime::new(Faults {
        fail_start: true,
        ..Default::default()
    });
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = FixedBridge::host_path(dir.path());
    let orchestrator = orchestrator(runtime.clone(), bridge.clone());

    let (io, _terminal) = session_io();
    let outcome = orchestrator
        .run(command_session("exit 0"), io, Arc::new(NoDialer), None, CancellationToken::new())
        .await;

    assert_eq!(outcome.status.code(), 255);
    assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.force_removed.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.open_count(), 0);
    // bridge + container
    assert_eq!(outcome.released, 2);
}

#[tokio::test]
async fn failed_attach_force_removes_the_container() {
    let runtime = ScriptedRuntime::new(Faults {
        fail_attach: true,
        ..Default::default()
    });
    let dir = tempfile::TempDir::new().unwrap();
    let orchestrator = orchestrator(runtime.clone(), FixedBridge::host_path(dir.path()));

    let (io, _terminal) = session_io();
    let outcome = orchestrator
        .run(command_session("exit 0"), io, Arc::new(NoDialer), None, CancellationToken::new())
        .await;

    assert_eq!(outcome.status, ExitStatus::ORCHESTRATOR_FAILURE);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.force_removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_after_start_removes_container_and_bridge() {
    let runtime = ScriptedRuntime::new(Faults::default());
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = FixedBridge::host_path(dir.path());
    let orchestrator = Arc::new(orchestrator(runtime.clone(), bridge.clone()));
    let cancel = CancellationToken::new();

    let (io, _terminal) = session_io();
    let task = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run(command_session("sleep 3600"), io, Arc::new(NoDialer), None, cancel)
                .await
        })
    };

    while runtime.running() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not unwind")
        .unwrap();
    assert!(matches!(outcome.error, Some(SessionError::Cancelled)));
    assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.force_removed.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.open_count(), 0);
}

#[tokio::test]
async fn resize_reaches_running_tty_container() {
    let runtime = ScriptedRuntime::new(Faults::default());
    let dir = tempfile::TempDir::new().unwrap();
    let orchestrator = Arc::new(orchestrator(runtime.clone(), FixedBridge::host_path(dir.path())));

    let initial = TerminalGeometry { cols: 80, rows: 24 };
    let feed = ResizeFeed::new(initial);
    let session = Session::new("dev").with_pty(PtyRequest {
        term: "xterm-256color".to_string(),
        geometry: initial,
    });

    let (io, _terminal) = session_io();
    let task = {
        let orchestrator = orchestrator.clone();
        let rx = feed.subscribe();
        tokio::spawn(async move {
            orchestrator
                .run(session, io, Arc::new(NoDialer), Some(rx), CancellationToken::new())
                .await
        })
    };

    while runtime.running() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    feed.push(initial);
    feed.push(TerminalGeometry { cols: 132, rows: 43 });
    while runtime.resizes.lock().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime.exit_all(0);

    let outcome = task.await.unwrap();
    assert_eq!(outcome.status, ExitStatus::SUCCESS);
    assert_eq!(
        *runtime.resizes.lock(),
        vec![TerminalGeometry { cols: 132, rows: 43 }]
    );

    let spec = runtime.specs.lock()[0].clone();
    assert!(spec.tty);
    assert_eq!(spec.command, vec!["sh"]);
    assert_eq!(spec.console_size, Some(initial));
    assert!(spec.env.contains(&"TERM=xterm-256color".to_string()));
}

#[tokio::test]
async fn concurrent_sessions_see_only_their_own_directory() {
    let left = tempfile::TempDir::new().unwrap();
    let right = tempfile::TempDir::new().unwrap();
    std::fs::write(left.path().join("left.txt"), b"l").unwrap();
    std::fs::write(right.path().join("right.txt"), b"r").unwrap();

    let runtime = ScriptedRuntime::new(Faults::default());
    let left_orchestrator = orchestrator(runtime.clone(), FixedBridge::host_path(left.path()));
    let right_orchestrator = orchestrator(runtime.clone(), FixedBridge::host_path(right.path()));

    let (left_io, mut left_terminal) = session_io();
    let (right_io, mut right_terminal) = session_io();
    let (left_outcome, right_outcome) = tokio::join!(
        left_orchestrator.run(command_session("ls"), left_io, Arc::new(NoDialer), None, CancellationToken::new()),
        right_orchestrator.run(command_session("ls"), right_io, Arc::new(NoDialer), None, CancellationToken::new()),
    );
    assert!(left_outcome.status.is_success());
    assert!(right_outcome.status.is_success());

    let left_listing = left_terminal.read_stdout().await;
    let right_listing = right_terminal.read_stdout().await;
    assert!(left_listing.contains("left.txt") && !left_listing.contains("right.txt"));
    assert!(right_listing.contains("right.txt") && !right_listing.contains("left.txt"));
}

#[tokio::test]
async fn nfs_endpoint_creates_and_removes_a_volume() {
    let runtime = ScriptedRuntime::new(Faults::default());
    let bridge = FixedBridge::with_endpoint(BridgeEndpoint::Nfs {
        volume: "sandshell-test".to_string(),
        host: "127.0.0.1".to_string(),
        port: 40123,
        extra_options: None,
    });
    let orchestrator = orchestrator(runtime.clone(), bridge);

    let (io, mut terminal) = session_io();
    let outcome = orchestrator
        .run(command_session("echo ok"), io, Arc::new(NoDialer), None, CancellationToken::new())
        .await;

    assert!(outcome.status.is_success());
    assert_eq!(terminal.read_stdout().await, "ok\n");
    assert_eq!(*runtime.volumes.lock(), vec!["sandshell-test".to_string()]);
    assert_eq!(*runtime.removed_volumes.lock(), vec!["sandshell-test".to_string()]);

    let spec = runtime.specs.lock()[0].clone();
    assert!(spec.mounts.iter().any(|m| matches!(
        m,
        ContainerMount::Volume { name, target } if name == "sandshell-test" && target == CONTAINER_PATH
    )));
}

#[tokio::test]
async fn lost_wait_reports_255_and_force_removes() {
    let runtime = ScriptedRuntime::new(Faults {
        fail_wait: true,
        ..Default::default()
    });
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = FixedBridge::host_path(dir.path());
    let orchestrator = orchestrator(runtime.clone(), bridge.clone());

    let (io, mut terminal) = session_io();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(command_session("cat"), io, Arc::new(NoDialer), None, CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, ExitStatus::ORCHESTRATOR_FAILURE);
    assert!(matches!(
        outcome.error,
        Some(SessionError::Runtime(RuntimeError::WaitFailed(_)))
    ));
    assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.force_removed.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.running(), 0);
    assert_eq!(bridge.open_count(), 0);

    let stderr = terminal.read_stderr().await;
    assert!(stderr.starts_with("sandshell: "), "{}", stderr);
    assert!(stderr.contains("daemon connection lost"));
}

#[tokio::test]
async fn exit_status_is_reported_before_cleanup() {
    let runtime = ScriptedRuntime::new(Faults::default());
    let dir = tempfile::TempDir::new().unwrap();
    let bridge = GatedBridge::new(dir.path());
    let orchestrator = Arc::new(orchestrator(runtime.clone(), bridge.clone()));

    let (mut io, _terminal) = session_io();
    let (status_tx, status_rx) = tokio::sync::oneshot::channel();
    io.status = Some(status_tx);
    let session = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .run(command_session("exit 3"), io, Arc::new(NoDialer), None, CancellationToken::new())
                .await
        })
    };

    let status = tokio::time::timeout(Duration::from_secs(5), status_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.code(), 3);
    // The bridge is still held open by its gate.
    assert_eq!(bridge.shut_down.load(Ordering::SeqCst), 0);
    assert!(!session.is_finished());

    bridge.release();
    let outcome = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status.code(), 3);
    assert_eq!(bridge.shut_down.load(Ordering::SeqCst), 1);
}
