// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::domain::runtime::{ContainerOutput, ContainerRequest, ContainerRuntime, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
    autopull: bool,
}

impl DockerRuntime {
    pub fn new(socket_path: Option<&str>, autopull: bool) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => {
                #[cfg(unix)]
                let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

                #[cfg(windows)]
                let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

                result.map_err(|e| {
                    RuntimeError::SpawnFailed(format!(
                        "Failed to connect to Docker at {}: {}\n\n\
                         Ensure Docker is running and the socket path is correct.",
                        path, e
                    ))
                })?
            }
            None => Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::SpawnFailed(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Check that the daemon is running (docker ps) and that the\n\
                     current user may access the Docker socket.",
                    e
                ))
            })?,
        };

        Ok(Self { docker, autopull })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::SpawnFailed(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.autopull {
            return Err(RuntimeError::ImageUnavailable(format!(
                "Image {} not found locally and autopull is disabled",
                image
            )));
        }

        info!("Pulling image: {}", image);
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::ImageUnavailable(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Start the container, follow its output and wait for the exit code.
    async fn execute(&self, id: &str) -> Result<ContainerOutput, RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::SpawnFailed(format!("Failed to start container: {}", e)))?;

        let options = LogsOptionsBuilder::default()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = Vec::new();
        let mut partial = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) | Ok(LogOutput::Console { message }) => {
                    partial.push_str(&String::from_utf8_lossy(&message));
                    while let Some(newline) = partial.find('\n') {
                        logs.push(partial[..newline].trim_end_matches('\r').to_string());
                        partial.drain(..=newline);
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(RuntimeError::ExecutionFailed(format!("Failed to read logs: {}", e))),
            }
        }
        if !partial.is_empty() {
            logs.push(partial);
        }

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(RuntimeError::ExecutionFailed(format!("Failed to wait for container: {}", e))),
            None => return Err(RuntimeError::ExecutionFailed("container wait stream ended early".to_string())),
        };

        Ok(ContainerOutput { exit_code, logs })
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::RemovalFailed(e.to_string()))?;
        debug!("Removed build container: {}", id);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, request: ContainerRequest) -> Result<ContainerOutput, RuntimeError> {
        self.ensure_image(&request.image).await?;

        let limits = request.limits;
        let host_config = HostConfig {
            binds: Some(request.binds.iter().map(|b| b.to_bind_spec()).collect()),
            nano_cpus: Some(limits.nano_cpus()),
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_swap_bytes),
            pids_limit: Some(limits.pids_limit),
            network_mode: request.network_disabled.then(|| "none".to_string()),
            ..Default::default()
        };

        let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let body = ContainerCreateBody {
            image: Some(request.image.clone()),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![request.script.clone()]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(request.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(&request.name).build();
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        let id = created.id;
        info!("Created build container {} ({})", request.name, id);

        let outcome = match tokio::time::timeout(request.timeout, self.execute(&id)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TimedOut(request.timeout)),
        };

        if let Err(e) = self.remove(&id).await {
            warn!("Build container {} left behind: {}", id, e);
        }
        outcome
    }
}
