use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{normalise_docker_state, BackendError, DeployOutcome, DeploymentBackend};
use crate::db::models::{Deployment, DeploymentStatus};
use crate::deployment::models::ResolvedServiceDefinition;

/// Classify a bollard error: 4xx daemon responses are logical failures
/// (bad image, name conflict), everything else is the daemon being
/// unreachable or broken.
fn classify(err: bollard::errors::Error) -> BackendError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code < 500 =>
        {
            BackendError::failed(err)
        }
        _ => BackendError::unavailable(err),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Thin wrapper over the local Docker daemon shared by the in-process
/// backend and the node agent.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        info!("pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image, status);
                    }
                }
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(())
    }

    /// Create and start a container from a resolved definition. Returns
    /// the container id and the first host-side port.
    pub async fn run_container(
        &self,
        name: &str,
        resolved: &ResolvedServiceDefinition,
    ) -> Result<(String, Option<u16>), BackendError> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut first_host_port: Option<u16> = None;

        for raw in &resolved.ports {
            let (host, container) = match raw.rsplit_once(':') {
                Some((host, container)) => (Some(host.trim()), container.trim()),
                None => (None, raw.trim()),
            };
            let container_key = format!("{}/tcp", container.split('/').next().unwrap_or(container));
            exposed_ports.insert(container_key.clone(), HashMap::new());
            if let Some(host) = host {
                if first_host_port.is_none() {
                    first_host_port = host.parse().ok();
                }
                port_bindings.insert(
                    container_key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host.to_string()),
                    }]),
                );
            }
        }

        let env: Vec<String> = resolved
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let restart_policy_name = match resolved.restart_policy.as_deref() {
            Some("no") => RestartPolicyNameEnum::NO,
            Some("always") => RestartPolicyNameEnum::ALWAYS,
            Some("on-failure") => RestartPolicyNameEnum::ON_FAILURE,
            _ => RestartPolicyNameEnum::UNLESS_STOPPED,
        };

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if resolved.volumes.is_empty() {
                None
            } else {
                Some(resolved.volumes.clone())
            },
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name),
                maximum_retry_count: None,
            }),
            network_mode: resolved.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(resolved.image.clone()),
            env: Some(env),
            cmd: resolved
                .command
                .as_ref()
                .map(|c| c.split_whitespace().map(|s| s.to_string()).collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        info!("creating container {} from {}", name, resolved.image);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(classify)?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;

        info!("container {} started ({})", name, &created.id[..12.min(created.id.len())]);
        Ok((created.id, first_host_port))
    }

    /// Container state string ("running", "exited", ...), or None if the
    /// container does not exist.
    pub async fn container_state(&self, name: &str) -> Result<Option<String>, BackendError> {
        match self.docker.inspect_container(name, None).await {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.status)
                .map(|status| status.to_string())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn stop_container(&self, name: &str) -> Result<(), BackendError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                warn!("stop: container {} already gone", name);
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn remove_container(&self, name: &str) -> Result<(), BackendError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    /// Names of currently running containers, for heartbeat reporting.
    pub async fn running_container_names(&self) -> Result<Vec<String>, BackendError> {
        let containers = self
            .docker
            .list_containers(Some(bollard::container::ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.names)
            .filter_map(|names| names.into_iter().next())
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    pub async fn container_logs(&self, name: &str, tail: i64) -> Result<Vec<String>, BackendError> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    lines.push(String::from_utf8_lossy(&message).trim_end().to_string());
                }
                Ok(_) => {}
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(lines)
    }
}

/// Backend for workloads on the same host as the control plane.
pub struct LocalDockerBackend {
    runtime: DockerRuntime,
}

impl LocalDockerBackend {
    pub fn new(runtime: DockerRuntime) -> Self {
        Self { runtime }
    }

    fn name_of(deployment: &Deployment) -> Result<&str, BackendError> {
        deployment
            .container_name
            .as_deref()
            .ok_or_else(|| BackendError::failed(anyhow!("deployment has no container name")))
    }
}

#[async_trait]
impl DeploymentBackend for LocalDockerBackend {
    async fn deploy(
        &self,
        _deployment: &Deployment,
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
    ) -> Result<DeployOutcome, BackendError> {
        self.runtime.pull_image(&resolved.image).await?;
        let (container_id, host_port) =
            self.runtime.run_container(container_name, resolved).await?;
        Ok(DeployOutcome {
            container_id: Some(container_id),
            exposed_port: host_port,
            access_url: host_port.map(|p| format!("http://localhost:{}", p)),
            metadata: json!({ "runtime": "docker", "local": true }),
        })
    }

    async fn status(&self, deployment: &Deployment) -> Result<DeploymentStatus, BackendError> {
        let name = Self::name_of(deployment)?;
        match self.runtime.container_state(name).await? {
            Some(state) => Ok(normalise_docker_state(&state)),
            None => Ok(DeploymentStatus::Failed),
        }
    }

    async fn stop(&self, deployment: &Deployment) -> Result<(), BackendError> {
        self.runtime.stop_container(Self::name_of(deployment)?).await
    }

    async fn remove(&self, deployment: &Deployment) -> Result<(), BackendError> {
        self.runtime
            .remove_container(Self::name_of(deployment)?)
            .await
    }

    async fn logs(&self, deployment: &Deployment, tail: i64) -> Result<Vec<String>, BackendError> {
        self.runtime
            .container_logs(Self::name_of(deployment)?, tail)
            .await
    }
}
