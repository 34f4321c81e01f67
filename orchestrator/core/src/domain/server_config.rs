// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Server Configuration Types
//
// Defines the configuration schema for a sandshell gateway, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - SSH listener, host key and authorized keys
// - Container defaults (image, shell, working directory)
// - Filesystem bridge transport selection
// - Runtime call, drain and resize timeouts
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::bridge::BridgeTransport;

pub const API_VERSION: &str = "sandshell.dev/v1";
pub const KIND: &str = "ServerConfig";

/// Top-level Kubernetes-style server configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigManifest {
    /// API version (must be "sandshell.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ServerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ServerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Server configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigSpec {
    /// SSH listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Ed25519 host key, generated on first start when missing
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// When set, only keys listed in this OpenSSH authorized_keys file may log in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys_path: Option<PathBuf>,

    #[serde(default)]
    pub container: ContainerDefaults,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDefaults {
    #[serde(default = "default_image")]
    pub image: String,

    /// Shell used for interactive sessions and as the `-c` interpreter for commands
    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_container_path")]
    pub working_dir: String,

    /// Docker network mode (e.g. "none", "bridge")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    /// Custom Docker socket; auto-detected when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub transport: BridgeTransport,

    /// Address dedicated listeners bind to. Loopback unless opted out, since
    /// anything that reaches the port can read the caller's directory.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Address the Docker daemon uses to reach a dedicated listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Parent directory for per-session host mounts (loopback-mount)
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Parent directory for per-session sockets (tunneled-channel)
    #[serde(default = "default_socket_root")]
    pub socket_root: PathBuf,

    /// Path of the caller's directory inside the container
    #[serde(default = "default_container_path")]
    pub container_path: String,

    /// Extra NFS mount options appended to the defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_mount_options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for every container runtime call except wait
    #[serde(with = "humantime_serde", default = "default_runtime_call")]
    pub runtime_call: Duration,

    /// How long output may keep draining after the container exits
    #[serde(with = "humantime_serde", default = "default_drain")]
    pub drain: Duration,

    #[serde(with = "humantime_serde", default = "default_resize")]
    pub resize: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("compact" or "json")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus scrape listener
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_host_key_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".sandshell").join("ssh_host_ed25519_key"))
        .unwrap_or_else(|| PathBuf::from("/etc/sandshell/ssh_host_ed25519_key"))
}

fn default_image() -> String {
    "alpine".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_container_path() -> String {
    "/local".to_string()
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/sandshell")
}

fn default_socket_root() -> PathBuf {
    PathBuf::from("/run/sandshell")
}

fn default_runtime_call() -> Duration {
    Duration::from_secs(30)
}

fn default_drain() -> Duration {
    Duration::from_secs(5)
}

fn default_resize() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9464".to_string()
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            image: default_image(),
            shell: default_shell(),
            working_dir: default_container_path(),
            network_mode: None,
            docker_socket_path: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: BridgeTransport::default(),
            listen_host: default_listen_host(),
            advertise_host: None,
            mount_root: default_mount_root(),
            socket_root: default_socket_root(),
            container_path: default_container_path(),
            nfs_mount_options: None,
        }
    }
}

impl BridgeConfig {
    /// Host the Docker daemon should dial for a dedicated listener.
    ///
    /// Falls back to loopback when the listener binds a wildcard address, since
    /// the daemon mounts volumes from the same host.
    pub fn advertised_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            return host.clone();
        }
        match self.listen_host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1".to_string(),
            other => other.to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            runtime_call: default_runtime_call(),
            drain: default_drain(),
            resize: default_resize(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl Default for ServerConfigSpec {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key_path: default_host_key_path(),
            authorized_keys_path: None,
            container: ContainerDefaults::default(),
            bridge: BridgeConfig::default(),
            timeouts: TimeoutConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ServerConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "sandshell".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ServerConfigSpec::default(),
        }
    }
}

impl ServerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SANDSHELL_CONFIG_PATH environment variable
    /// 2. ./sandshell.yaml (working directory)
    /// 3. ~/.sandshell/config.yaml (user home)
    /// 4. /etc/sandshell/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SANDSHELL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./sandshell.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".sandshell").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/sandshell/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must load
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(image) = lookup("SANDSHELL_IMAGE").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: SANDSHELL_IMAGE={}", image);
            self.spec.container.image = image;
        }

        if let Some(val) = lookup("SANDSHELL_BRIDGE") {
            match val.parse::<BridgeTransport>() {
                Ok(transport) => {
                    tracing::info!("Environment override: SANDSHELL_BRIDGE={}", transport);
                    self.spec.bridge.transport = transport;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for SANDSHELL_BRIDGE: '{}'. Expected tunneled-channel, dedicated-listener or loopback-mount. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(host) = lookup("PROXY_LISTEN").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: PROXY_LISTEN={}", host);
            self.spec.bridge.listen_host = host;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.listen.is_empty() {
            anyhow::bail!("spec.listen cannot be empty");
        }

        if self.spec.container.image.trim().is_empty() {
            anyhow::bail!("spec.container.image cannot be empty");
        }

        if self.spec.container.shell.trim().is_empty() {
            anyhow::bail!("spec.container.shell cannot be empty");
        }

        if !self.spec.container.working_dir.starts_with('/') {
            anyhow::bail!(
                "spec.container.working_dir must be absolute: '{}'",
                self.spec.container.working_dir
            );
        }

        if !self.spec.bridge.container_path.starts_with('/') {
            anyhow::bail!(
                "spec.bridge.container_path must be absolute: '{}'",
                self.spec.bridge.container_path
            );
        }

        let timeouts = &self.spec.timeouts;
        for (name, value) in [
            ("runtime_call", timeouts.runtime_call),
            ("drain", timeouts.drain),
            ("resize", timeouts.resize),
        ] {
            if value.is_zero() {
                anyhow::bail!("spec.timeouts.{} must be greater than zero", name);
            }
        }

        Ok(())
    }
}
