// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # sandshell
//!
//! Disposable container shells that see the caller's working directory.
//!
//! ## Commands
//!
//! - `sandshell serve` - Run the SSH gateway that turns each session into a container
//! - `sandshell connect HOST [-- COMMAND...]` - Open a session and export the current directory
//! - `sandshell config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{ConfigCommand, ConnectArgs};
use sandshell_core::domain::server_config::ServerConfigManifest;

/// sandshell - Sandboxed shells over SSH
#[derive(Parser)]
#[command(name = "sandshell")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SANDSHELL_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SANDSHELL_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SSH gateway
    #[command(name = "serve")]
    Serve,

    /// Connect to a gateway and share the current directory
    #[command(name = "connect")]
    Connect(ConnectArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            // The manifest's logging section applies unless the flag overrides it
            let logging = ServerConfigManifest::load_or_default(cli.config.clone())
                .map(|c| c.spec.observability.logging)
                .unwrap_or_default();
            let level = cli.log_level.unwrap_or(logging.level);
            init_logging(&level, &logging.format)?;
            commands::serve::run(cli.config).await
        }
        Commands::Connect(args) => {
            // Raw-mode terminals make chatty logs unreadable
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            let code = commands::connect::run(args).await?;
            std::process::exit(code as i32);
        }
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::config::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
