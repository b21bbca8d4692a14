//! Deployment backends.
//!
//! Every concrete target type implements the same contract and returns
//! normalised lifecycle states; the engine never sees backend-specific
//! status strings.

pub mod docker;
pub mod kubernetes;
pub mod remote;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::models::{Deployment, DeploymentStatus};
use crate::deployment::models::ResolvedServiceDefinition;

pub use docker::{DockerRuntime, LocalDockerBackend};
pub use kubernetes::KubernetesBackend;
pub use remote::RemoteDockerBackend;

/// Backend failure classification. `Unavailable` errors are transient
/// (timeouts, unreachable collaborators) and leave deployment state
/// untouched; `Failed` errors are logical rejections that mark the
/// deployment failed and are not auto-retried.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("backend operation failed: {0}")]
    Failed(#[source] anyhow::Error),
}

impl BackendError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }
}

/// What a backend reports after placing a workload.
#[derive(Debug, Clone, Default)]
pub struct DeployOutcome {
    pub container_id: Option<String>,
    pub exposed_port: Option<u16>,
    pub access_url: Option<String>,
    pub metadata: Value,
}

#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// Place the resolved definition on the target under `container_name`.
    async fn deploy(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
    ) -> Result<DeployOutcome, BackendError>;

    /// Current state of the workload, normalised to the engine's enum.
    async fn status(&self, deployment: &Deployment) -> Result<DeploymentStatus, BackendError>;

    async fn stop(&self, deployment: &Deployment) -> Result<(), BackendError>;

    /// Delete all backend resources. Must tolerate already-gone workloads.
    async fn remove(&self, deployment: &Deployment) -> Result<(), BackendError>;

    async fn logs(&self, deployment: &Deployment, tail: i64) -> Result<Vec<String>, BackendError>;
}

/// Map a Docker container state string to the lifecycle enum.
pub fn normalise_docker_state(state: &str) -> DeploymentStatus {
    match state {
        "running" => DeploymentStatus::Running,
        "created" | "restarting" => DeploymentStatus::Deploying,
        "exited" | "paused" => DeploymentStatus::Stopped,
        "removing" => DeploymentStatus::Removing,
        "dead" => DeploymentStatus::Failed,
        _ => DeploymentStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_docker_state() {
        assert_eq!(normalise_docker_state("running"), DeploymentStatus::Running);
        assert_eq!(normalise_docker_state("exited"), DeploymentStatus::Stopped);
        assert_eq!(normalise_docker_state("paused"), DeploymentStatus::Stopped);
        assert_eq!(normalise_docker_state("created"), DeploymentStatus::Deploying);
        assert_eq!(normalise_docker_state("dead"), DeploymentStatus::Failed);
        assert_eq!(normalise_docker_state("gibberish"), DeploymentStatus::Failed);
    }
}
