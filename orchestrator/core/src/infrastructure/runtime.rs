// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker adapter for [`ContainerRuntime`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Translate container lifecycle calls into Docker Engine API requests

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::domain::container::{
    ContainerId, ContainerMount, ContainerOutput, ContainerSpec, ContainerStdio, VolumeSpec,
};
use crate::domain::resize::TerminalGeometry;
use crate::domain::runtime::{ContainerRuntime, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
    autopull: bool,
}

impl DockerRuntime {
    pub fn new(socket_path: Option<String>, autopull: bool) -> Result<Self, RuntimeError> {
        // Connect to Docker daemon (custom socket or auto-detect)
        let docker = if let Some(path) = socket_path {
            Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                RuntimeError::RuntimeUnavailable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::RuntimeUnavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - Add user to docker group: sudo usermod -aG docker $USER",
                    e
                ))
            })?
        };

        Ok(Self { docker, autopull })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::RuntimeUnavailable(format!(
                "Cannot connect to Docker daemon: {}\n\n\
                 Docker healthcheck failed. Ensure Docker is running:\n\
                 - On Linux: sudo systemctl start docker\n\
                 - On macOS: Start Docker Desktop\n\n\
                 Verify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() || !self.autopull {
            return Ok(());
        }

        info!("Image {} not found locally, pulling", image);
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| classify(e, RuntimeError::CreateRejected))?;
        }
        Ok(())
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let mut binds = Vec::new();
        let mut mounts = Vec::new();
        for mount in &spec.mounts {
            match mount {
                ContainerMount::Bind {
                    source,
                    target,
                    read_only,
                } => {
                    let mode = if *read_only { "ro" } else { "rw" };
                    binds.push(format!("{}:{}:{}", source.display(), target, mode));
                }
                ContainerMount::Volume { name, target } => mounts.push(Mount {
                    target: Some(target.clone()),
                    source: Some(name.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    read_only: Some(false),
                    ..Default::default()
                }),
            }
        }

        HostConfig {
            auto_remove: Some(spec.auto_remove),
            binds: (!binds.is_empty()).then_some(binds),
            mounts: (!mounts.is_empty()).then_some(mounts),
            network_mode: spec.network_mode.clone(),
            console_size: spec
                .console_size
                .filter(|g| !g.is_empty())
                .map(|g| vec![g.rows as i32, g.cols as i32]),
            ..Default::default()
        }
    }
}

/// Connection-level failures mean the daemon is gone, not that it refused us.
fn classify(err: DockerError, rejected: fn(String) -> RuntimeError) -> RuntimeError {
    match err {
        DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::RequestTimeoutError => RuntimeError::RuntimeUnavailable(err.to_string()),
        other => rejected(other.to_string()),
    }
}

/// 409 on a container means removal is already in progress (auto-remove).
fn is_already_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            tty: Some(spec.tty),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| classify(e, RuntimeError::CreateRejected))?;

        for warning in &response.warnings {
            debug!("Docker create warning: {}", warning);
        }
        Ok(ContainerId(response.id))
    }

    async fn attach(&self, id: &ContainerId) -> Result<ContainerStdio, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id.as_str(), Some(options))
            .await
            .map_err(|e| classify(e, RuntimeError::AttachRejected))?;

        let output = output
            .map(|frame| match frame {
                Ok(LogOutput::StdErr { message }) => Ok(ContainerOutput::Stderr(message)),
                Ok(other) => Ok(ContainerOutput::Stdout(other.into_bytes())),
                Err(e) => Err(RuntimeError::StreamFailed(e.to_string())),
            })
            .boxed();

        Ok(ContainerStdio { output, input })
    }

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, RuntimeError::StartRejected))
    }

    async fn resize(&self, id: &ContainerId, geometry: TerminalGeometry) -> Result<(), RuntimeError> {
        let options = ResizeContainerTtyOptions {
            width: geometry.cols,
            height: geometry.rows,
        };
        self.docker
            .resize_container_tty(id.as_str(), options)
            .await
            .map_err(|e| classify(e, RuntimeError::ResizeRejected))
    }

    async fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "next-exit".to_string(),
        };
        let mut stream = self.docker.wait_container(id.as_str(), Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::WaitFailed(e.to_string())),
            None => Err(RuntimeError::WaitFailed(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => {
                debug!("Container {} already removed", id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::RemoveFailed(e.to_string())),
        }
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError> {
        let options = CreateVolumeOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            driver_opts: spec.driver_opts.clone(),
            labels: spec.labels.clone(),
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| classify(e, RuntimeError::VolumeRejected))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            // 409: still referenced by a container that is being removed
            Err(e) => Err(RuntimeError::VolumeRejected(e.to_string())),
        }
    }
}
