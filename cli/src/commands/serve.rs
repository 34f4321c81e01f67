// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `sandshell serve`: the SSH gateway.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandshell_core::application::SessionOrchestrator;
use sandshell_core::domain::server_config::ServerConfigManifest;
use sandshell_core::infrastructure::ssh::keys::{load_authorized_keys, load_or_generate_host_key};
use sandshell_core::infrastructure::ssh::{run_server, ServerState};
use sandshell_core::infrastructure::DockerRuntime;

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = ServerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;
    info!(
        "Configuration loaded: gateway={} bridge={} image={}",
        config.metadata.name, config.spec.bridge.transport, config.spec.container.image
    );
    let spec = config.spec;

    if spec.observability.metrics.enabled {
        let addr: SocketAddr = spec
            .observability
            .metrics
            .listen
            .parse()
            .with_context(|| {
                format!(
                    "Invalid metrics listen address: {}",
                    spec.observability.metrics.listen
                )
            })?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let runtime = DockerRuntime::new(spec.container.docker_socket_path.clone(), true)
        .context("Failed to initialize Docker runtime")?;
    runtime
        .healthcheck()
        .await
        .context("Docker daemon is not reachable")?;

    let host_key = load_or_generate_host_key(&spec.host_key_path)
        .await
        .context("Failed to prepare host key")?;

    let authorized_keys = match &spec.authorized_keys_path {
        Some(path) => {
            let keys = load_authorized_keys(path)
                .with_context(|| format!("Failed to load authorized keys from {:?}", path))?;
            info!("{} authorized keys loaded", keys.len());
            Some(keys)
        }
        None => {
            warn!("No authorized_keys_path configured; any public key will be accepted");
            None
        }
    };

    let orchestrator = Arc::new(SessionOrchestrator::from_config(&spec, Arc::new(runtime)));
    let state = Arc::new(ServerState {
        orchestrator,
        authorized_keys,
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    run_server(&spec.listen, host_key, state, shutdown)
        .await
        .context("SSH server failed")?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
