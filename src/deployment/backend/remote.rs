use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{normalise_docker_state, BackendError, DeployOutcome, DeploymentBackend};
use crate::config_store::SettingsStore;
use crate::db::models::{Deployment, DeploymentStatus, UNode};
use crate::db::unodes;
use crate::deployment::models::ResolvedServiceDefinition;

pub const NODE_SECRET_HEADER: &str = "X-Node-Secret";

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(300);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire contract between the control plane and the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeployRequest {
    pub container_name: String,
    pub definition: ResolvedServiceDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeployResponse {
    pub container_id: String,
    #[serde(default)]
    pub exposed_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusResponse {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogsResponse {
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Backend that dispatches every operation to the target u-node's agent
/// over the overlay network.
pub struct RemoteDockerBackend {
    db: PgPool,
    store: Arc<SettingsStore>,
    agent_port: u16,
    http: reqwest::Client,
}

impl RemoteDockerBackend {
    pub fn new(db: PgPool, store: Arc<SettingsStore>, agent_port: u16) -> Self {
        Self {
            db,
            store,
            agent_port,
            http: reqwest::Client::new(),
        }
    }

    async fn node_for(&self, deployment: &Deployment) -> Result<UNode, BackendError> {
        let hostname = deployment
            .unode_hostname
            .as_deref()
            .ok_or_else(|| BackendError::failed(anyhow!("deployment has no target u-node")))?;
        let node = unodes::find_by_hostname(&self.db, hostname)
            .await
            .map_err(BackendError::unavailable)?
            .ok_or_else(|| BackendError::failed(anyhow!("u-node '{}' not found", hostname)))?;
        Ok(node)
    }

    fn agent_base(&self, node: &UNode) -> Result<String, BackendError> {
        let ip = node.overlay_ip.as_deref().ok_or_else(|| {
            BackendError::failed(anyhow!("u-node '{}' has no overlay IP", node.hostname))
        })?;
        Ok(format!("http://{}:{}", ip, self.agent_port))
    }

    fn node_secret(&self) -> String {
        self.store.get_nonempty("node_secret").unwrap_or_default()
    }

    /// Map an agent response to the backend error taxonomy: transport
    /// errors and 5xx are transient, anything else the agent rejected.
    async fn check(
        response: Result<reqwest::Response, reqwest::Error>,
        operation: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let response = response
            .map_err(|e| BackendError::unavailable(anyhow!("agent {} failed: {}", operation, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = anyhow!("agent {} returned {}: {}", operation, status, body);
        if status.is_server_error() {
            Err(BackendError::unavailable(err))
        } else {
            Err(BackendError::failed(err))
        }
    }

    fn container_name_of(deployment: &Deployment) -> Result<&str, BackendError> {
        deployment
            .container_name
            .as_deref()
            .ok_or_else(|| BackendError::failed(anyhow!("deployment has no container name")))
    }
}

#[async_trait]
impl DeploymentBackend for RemoteDockerBackend {
    async fn deploy(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
    ) -> Result<DeployOutcome, BackendError> {
        let node = self.node_for(deployment).await?;
        let base = self.agent_base(&node)?;
        info!(
            "deploying {} to u-node {} via {}",
            resolved.service_id, node.hostname, base
        );

        let response = self
            .http
            .post(format!("{}/api/deploy", base))
            .header(NODE_SECRET_HEADER, self.node_secret())
            .timeout(DEPLOY_TIMEOUT)
            .json(&AgentDeployRequest {
                container_name: container_name.to_string(),
                definition: resolved.clone(),
            })
            .send()
            .await;

        let result: AgentDeployResponse = Self::check(response, "deploy")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::unavailable(anyhow!("bad agent response: {}", e)))?;

        // Prefer the stable overlay DNS name when a tailnet is configured.
        let access_url = result.exposed_port.map(|port| {
            match self.store.get_nonempty("tailscale.tailnet_domain") {
                Some(domain) => format!("http://{}.{}:{}", node.hostname, domain, port),
                None => format!(
                    "http://{}:{}",
                    node.overlay_ip.as_deref().unwrap_or(&node.hostname),
                    port
                ),
            }
        });

        Ok(DeployOutcome {
            container_id: Some(result.container_id),
            exposed_port: result.exposed_port,
            access_url,
            metadata: json!({
                "runtime": "docker",
                "unode": node.hostname,
                "agent": base,
            }),
        })
    }

    async fn status(&self, deployment: &Deployment) -> Result<DeploymentStatus, BackendError> {
        let node = self.node_for(deployment).await?;
        let base = self.agent_base(&node)?;
        let name = Self::container_name_of(deployment)?;

        let response = self
            .http
            .get(format!("{}/api/status/{}", base, name))
            .header(NODE_SECRET_HEADER, self.node_secret())
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        let result: AgentStatusResponse = Self::check(response, "status")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::unavailable(anyhow!("bad agent response: {}", e)))?;

        Ok(result
            .status
            .as_deref()
            .map(normalise_docker_state)
            .unwrap_or(DeploymentStatus::Failed))
    }

    async fn stop(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let node = self.node_for(deployment).await?;
        let base = self.agent_base(&node)?;
        let name = Self::container_name_of(deployment)?;

        let response = self
            .http
            .post(format!("{}/api/stop/{}", base, name))
            .header(NODE_SECRET_HEADER, self.node_secret())
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await;
        Self::check(response, "stop").await?;
        Ok(())
    }

    async fn remove(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let node = self.node_for(deployment).await?;
        let base = self.agent_base(&node)?;
        let name = Self::container_name_of(deployment)?;

        let response = self
            .http
            .delete(format!("{}/api/remove/{}", base, name))
            .header(NODE_SECRET_HEADER, self.node_secret())
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await;
        Self::check(response, "remove").await?;
        Ok(())
    }

    async fn logs(&self, deployment: &Deployment, tail: i64) -> Result<Vec<String>, BackendError> {
        let node = self.node_for(deployment).await?;
        let base = self.agent_base(&node)?;
        let name = Self::container_name_of(deployment)?;

        let response = self
            .http
            .get(format!("{}/api/logs/{}?tail={}", base, name, tail))
            .header(NODE_SECRET_HEADER, self.node_secret())
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await;

        let result: AgentLogsResponse = Self::check(response, "logs")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::unavailable(anyhow!("bad agent response: {}", e)))?;
        Ok(result.logs)
    }
}
