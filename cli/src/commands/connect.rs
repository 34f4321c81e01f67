// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `sandshell connect`: open a session on a gateway and export the current
//! directory to it.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use sandshell_core::domain::resize::TerminalGeometry;
use sandshell_core::infrastructure::nfs::NfsExport;
use sandshell_core::infrastructure::ssh::keys::{default_identity, load_identity};
use sandshell_core::infrastructure::ssh::{
    run_client, AcceptAny, ClientIo, ClientOptions, HostKeyPolicy, KnownHosts,
};

const DEFAULT_PORT: u16 = 22;

#[derive(Args)]
pub struct ConnectArgs {
    /// Gateway address: [USER@]HOST[:PORT]
    #[arg(value_name = "DESTINATION")]
    destination: String,

    /// Remote user (default: $USER)
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// Private key (default: ~/.ssh/id_ed25519, id_ecdsa or id_rsa)
    #[arg(short, long, value_name = "FILE")]
    identity: Option<PathBuf>,

    /// known_hosts file used to verify the gateway (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "FILE", conflicts_with = "insecure_accept_any_host_key")]
    known_hosts: Option<PathBuf>,

    /// Trust whatever host key the gateway presents
    #[arg(long)]
    insecure_accept_any_host_key: bool,

    /// Command to run instead of an interactive shell (after `--`)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct Destination {
    user: Option<String>,
    host: String,
    port: u16,
}

fn parse_destination(input: &str) -> Result<Destination> {
    let (user, rest) = match input.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return Err(anyhow!("empty user in '{}'", input)),
        None => (None, input),
    };

    // [v6]:port, v4:port or a bare host
    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated '[' in '{}'", input))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(anyhow!("unexpected '{}' after address", tail)),
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            _ => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(anyhow!("missing host in '{}'", input));
    }
    let port = match port {
        Some(port) => port
            .parse()
            .with_context(|| format!("invalid port '{}'", port))?,
        None => DEFAULT_PORT,
    };

    Ok(Destination {
        user,
        host: host.to_string(),
        port,
    })
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enter raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

fn terminal_geometry() -> TerminalGeometry {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => TerminalGeometry { cols, rows },
        Err(_) => TerminalGeometry { cols: 80, rows: 24 },
    }
}

/// Publish the terminal size on every SIGWINCH.
fn watch_geometry() -> (watch::Receiver<TerminalGeometry>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(terminal_geometry());
    let task = tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut winch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    debug!("SIGWINCH unavailable: {}", e);
                    return;
                }
            };
            while winch.recv().await.is_some() {
                let geometry = terminal_geometry();
                if tx.send_replace(geometry) != geometry {
                    debug!("Terminal resized to {}x{}", geometry.cols, geometry.rows);
                }
            }
        }
        #[cfg(not(unix))]
        drop(tx);
    });
    (rx, task)
}

/// Run the session; returns the remote exit status.
pub async fn run(args: ConnectArgs) -> Result<u32> {
    let destination = parse_destination(&args.destination)?;
    let user = args
        .user
        .or(destination.user)
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| anyhow!("no user given and $USER is not set"))?;

    let identity_path = args
        .identity
        .or_else(default_identity)
        .ok_or_else(|| anyhow!("no identity given and none found in ~/.ssh"))?;
    let identity = load_identity(&identity_path)?;

    let policy: Arc<dyn HostKeyPolicy> = if args.insecure_accept_any_host_key {
        eprintln!(
            "{}",
            "warning: accepting any host key; the connection can be intercepted".yellow()
        );
        Arc::new(AcceptAny)
    } else {
        match args.known_hosts {
            Some(path) => Arc::new(KnownHosts::new(path)),
            None => Arc::new(
                KnownHosts::user_default()
                    .ok_or_else(|| anyhow!("cannot locate ~/.ssh/known_hosts"))?,
            ),
        }
    };

    let working_dir = std::env::current_dir()
        .and_then(|p| p.canonicalize())
        .context("Failed to resolve the current directory")?;
    let export = NfsExport::serve(&working_dir, "127.0.0.1:0")
        .await
        .context("Failed to export the current directory")?;
    info!(
        "Sharing {} through {}",
        working_dir.display(),
        export.local_addr()
    );

    let command = (!args.command.is_empty()).then(|| args.command.join(" "));
    let interactive = command.is_none() && std::io::stdin().is_terminal();

    let (geometry, resize_task) = if interactive {
        let (rx, task) = watch_geometry();
        (Some(rx), Some(task))
    } else {
        (None, None)
    };
    let raw_mode = if interactive {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };

    let options = ClientOptions {
        host: destination.host,
        port: destination.port,
        user,
        identity,
        policy,
        command,
        term: std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string()),
        working_dir: working_dir.to_string_lossy().into_owned(),
        export_addr: export.local_addr(),
    };
    let io = ClientIo {
        stdin: Box::pin(tokio::io::stdin()),
        stdout: Box::pin(tokio::io::stdout()),
        stderr: Box::pin(tokio::io::stderr()),
        geometry,
    };

    let result = run_client(options, io).await;

    drop(raw_mode);
    if let Some(task) = resize_task {
        task.abort();
    }
    export.stop();

    let status = result.context("Session failed")?;
    debug!("Remote exit status {}", status);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only() {
        let d = parse_destination("gateway.local").unwrap();
        assert_eq!(d.user, None);
        assert_eq!(d.host, "gateway.local");
        assert_eq!(d.port, 22);
    }

    #[test]
    fn test_parse_user_host_port() {
        let d = parse_destination("dev@10.0.0.5:2222").unwrap();
        assert_eq!(d.user.as_deref(), Some("dev"));
        assert_eq!(d.host, "10.0.0.5");
        assert_eq!(d.port, 2222);
    }

    #[test]
    fn test_parse_ipv6() {
        let d = parse_destination("[::1]:2200").unwrap();
        assert_eq!(d.host, "::1");
        assert_eq!(d.port, 2200);

        let d = parse_destination("fe80::1").unwrap();
        assert_eq!(d.host, "fe80::1");
        assert_eq!(d.port, 22);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_destination("").is_err());
        assert!(parse_destination("@host").is_err());
        assert!(parse_destination("host:notaport").is_err());
        assert!(parse_destination("[::1").is_err());
    }
}
