// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use sandshell_core::domain::server_config::ServerConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path (default: ./sandshell.yaml)
        #[arg(short, long, default_value = "./sandshell.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = ServerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SANDSHELL_CONFIG_PATH: {}",
            std::env::var("SANDSHELL_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./sandshell.yaml");
        println!("  4. ~/.sandshell/config.yaml");
        println!("  5. /etc/sandshell/config.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{}", yaml);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Gateway:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Listen: {}", spec.listen);
    println!("  Host key: {}", spec.host_key_path.display());
    match &spec.authorized_keys_path {
        Some(path) => println!("  Authorized keys: {}", path.display()),
        None => println!("  Authorized keys: {}", "(any key accepted)".yellow()),
    }
    println!();

    println!("{}", "Container:".bold());
    println!("  Image: {}", spec.container.image);
    println!("  Shell: {}", spec.container.shell);
    println!("  Working dir: {}", spec.container.working_dir);
    if let Some(mode) = &spec.container.network_mode {
        println!("  Network mode: {}", mode);
    }
    if let Some(socket) = &spec.container.docker_socket_path {
        println!("  Docker socket: {}", socket);
    }
    println!();

    println!("{}", "Filesystem bridge:".bold());
    println!("  Transport: {}", spec.bridge.transport);
    println!("  Container path: {}", spec.bridge.container_path);
    println!("  Listen host: {}", spec.bridge.listen_host);
    println!("  Advertised host: {}", spec.bridge.advertised_host());
    println!("  Mount root: {}", spec.bridge.mount_root.display());
    println!("  Socket root: {}", spec.bridge.socket_root.display());
    println!();

    println!("{}", "Timeouts:".bold());
    println!("  Runtime call: {:?}", spec.timeouts.runtime_call);
    println!("  Drain: {:?}", spec.timeouts.drain);
    println!("  Resize: {:?}", spec.timeouts.resize);
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        spec.observability.logging.level, spec.observability.logging.format
    );
    if spec.observability.metrics.enabled {
        println!("  Metrics: {}", spec.observability.metrics.listen);
    } else {
        println!("  Metrics: {}", "(disabled)".dimmed());
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ServerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    ServerConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
