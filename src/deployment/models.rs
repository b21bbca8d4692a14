use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db::models::{DeploymentStatus, TargetType};
use crate::registry::ServiceDefinition;

/// A service definition with every declared environment variable either
/// bound to a concrete value or dropped with a diagnostic at resolution
/// time. This is the payload handed to backends and snapshotted on the
/// deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedServiceDefinition {
    pub service_id: String,
    pub compose_service_name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// Literal overrides from an imported service's .env sidecar; on
    /// Kubernetes these become ConfigMap entries.
    #[serde(default)]
    pub env_literals: BTreeMap<String, String>,
}

impl ResolvedServiceDefinition {
    pub fn from_definition(
        definition: &ServiceDefinition,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            service_id: definition.id.clone(),
            compose_service_name: definition.service_name.clone(),
            image: definition.image.clone(),
            ports: definition.ports.clone(),
            environment,
            volumes: definition.volumes.clone(),
            command: definition.command.clone(),
            restart_policy: definition.restart_policy.clone(),
            network: definition.network.clone(),
            health_check_path: definition.health_check_path.clone(),
            env_literals: definition.env_literals.clone(),
        }
    }

    /// First declared port as (host, container); mirrors the definition's
    /// primary-port rule.
    pub fn primary_port(&self) -> Option<(Option<u16>, u16)> {
        let raw = self.ports.first()?;
        let (host_part, container_part) = match raw.rsplit_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, raw.as_str()),
        };
        let container: u16 = container_part
            .split('/')
            .next()
            .and_then(|p| p.trim().parse().ok())?;
        let host = host_part.and_then(|h| h.trim().parse().ok());
        Some((host, container))
    }
}

/// Deploy request body for `POST /api/deployments`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub service_id: String,
    #[serde(default = "default_target_type")]
    pub target_type: TargetType,
    #[serde(default)]
    pub unode_hostname: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub ingress_host: Option<String>,
}

fn default_target_type() -> TargetType {
    TargetType::DockerUnode
}

/// Deterministic container name: service name plus a short hash of the
/// (service id, deployment id) pair, stable across retries of the same
/// deployment.
pub fn container_name(service: &ResolvedServiceDefinition, deployment_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.service_id.as_bytes());
    hasher.update(b":");
    hasher.update(deployment_id.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", service.compose_service_name, short)
}

/// Valid edges of the deployment state machine.
pub mod state_machine {
    use super::DeploymentStatus;

    pub fn is_terminal(status: DeploymentStatus) -> bool {
        matches!(status, DeploymentStatus::Removed)
    }

    pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Pending, Removing)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Deploying, Stopping)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Removing)
                | (Failed, Removing)
                | (Removing, Removed)
                | (Removing, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::{can_transition, is_terminal};
    use super::*;
    use crate::db::models::DeploymentStatus::*;

    fn resolved() -> ResolvedServiceDefinition {
        ResolvedServiceDefinition {
            service_id: "nginx:nginx".into(),
            compose_service_name: "nginx".into(),
            image: "nginx:1.27-alpine".into(),
            ports: vec!["8080:80".into()],
            environment: BTreeMap::new(),
            volumes: vec![],
            command: None,
            restart_policy: None,
            network: None,
            health_check_path: None,
            env_literals: BTreeMap::new(),
        }
    }

    #[test]
    fn test_happy_path_edges() {
        assert!(can_transition(Pending, Deploying));
        assert!(can_transition(Deploying, Running));
        assert!(can_transition(Running, Stopping));
        assert!(can_transition(Stopping, Stopped));
        assert!(can_transition(Stopped, Removing));
        assert!(can_transition(Removing, Removed));
    }

    #[test]
    fn test_invalid_edges_rejected() {
        assert!(!can_transition(Pending, Running));
        assert!(!can_transition(Removed, Deploying));
        assert!(!can_transition(Stopped, Running));
        assert!(!can_transition(Failed, Running));
        assert!(is_terminal(Removed));
        assert!(!is_terminal(Failed));
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let id = Uuid::parse_str("6dd56d6c-5c20-4df5-9c6e-4f5f2c0a2c4e").unwrap();
        let a = container_name(&resolved(), id);
        let b = container_name(&resolved(), id);
        assert_eq!(a, b);
        assert!(a.starts_with("nginx-"));
        assert_eq!(a.len(), "nginx-".len() + 8);

        let other = container_name(&resolved(), Uuid::new_v4());
        assert_ne!(a, other);
    }

    #[test]
    fn test_resolved_primary_port() {
        assert_eq!(resolved().primary_port(), Some((Some(8080), 80)));
    }
}
