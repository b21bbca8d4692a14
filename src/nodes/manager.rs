use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::config_store::SettingsStore;
use crate::db::models::{JoinToken, NodeLiveness, NodeRole, UNode};
use crate::db::{join_tokens, unodes};
use crate::error::{ApiError, ErrorKind};

/// Node registration payload. Unknown fields are accepted for forward
/// compatibility with newer agents.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinNodeRequest {
    pub hostname: String,
    #[serde(default)]
    pub overlay_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// Heartbeat payload; same forward-compatibility rule.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub services_running: Vec<String>,
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinTokenRequest {
    #[serde(default = "default_expiry_hours")]
    pub expires_in_hours: i64,
    #[serde(default = "default_max_uses")]
    pub max_uses: i32,
    #[serde(default = "default_role")]
    pub role: NodeRole,
}

fn default_expiry_hours() -> i64 {
    24
}

fn default_max_uses() -> i32 {
    1
}

fn default_role() -> NodeRole {
    NodeRole::Worker
}

/// Lifecycle of remote u-nodes: join-token issuance and redemption,
/// heartbeat tracking, and the derived liveness view used for target
/// selection.
pub struct NodeManager {
    db: PgPool,
    store: Arc<SettingsStore>,
    heartbeat_interval: Duration,
}

impl NodeManager {
    pub fn new(db: PgPool, store: Arc<SettingsStore>, heartbeat_interval_secs: u64) -> Self {
        Self {
            db,
            store,
            heartbeat_interval: Duration::seconds(heartbeat_interval_secs as i64),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn random_token(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    /// The shared secret agents use for heartbeats and the leader uses
    /// for agent calls. Generated and persisted on first use; rotatable
    /// by writing a new value to the store.
    pub fn node_secret(&self) -> Result<String, ApiError> {
        if let Some(secret) = self.store.get_nonempty("node_secret") {
            return Ok(secret);
        }
        let secret = Self::random_token(48);
        self.store
            .update(&json!({ "node_secret": secret }))
            .map_err(|e| ApiError::internal_anyhow(e, "Failed to persist node secret"))?;
        info!("generated new node secret");
        Ok(secret)
    }

    pub fn verify_node_secret(&self, presented: &str) -> Result<(), ApiError> {
        let expected = self.node_secret()?;
        if presented != expected {
            return Err(ApiError::unauthorized("Invalid node secret"));
        }
        Ok(())
    }

    pub async fn create_join_token(&self, request: JoinTokenRequest) -> Result<JoinToken, ApiError> {
        let expires_at = Utc::now() + Duration::hours(request.expires_in_hours.max(1));
        let token = join_tokens::create(
            &self.db,
            &Self::random_token(40),
            request.role,
            expires_at,
            request.max_uses.max(1),
        )
        .await?;
        info!(
            "join token created (role {}, {} uses, expires {})",
            token.role, token.remaining_uses, token.expires_at
        );
        Ok(token)
    }

    /// Redeem a join token and register the node. The token is consumed
    /// atomically, so a max_uses = 1 token admits exactly one node.
    pub async fn redeem_join(&self, token: &str, request: JoinNodeRequest) -> Result<UNode, ApiError> {
        let token = join_tokens::redeem(&self.db, token)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid, expired or spent join token"))?;

        let hostname = self.qualified_hostname(&request.hostname, token.role).await?;
        let node = unodes::create(
            &self.db,
            &hostname,
            request.overlay_ip.as_deref(),
            token.role,
            &request.capabilities,
        )
        .await?;
        info!("u-node '{}' joined as {}", node.hostname, node.role);
        Ok(node)
    }

    /// Role-qualified hostname remapping: keep the requested name when it
    /// is free, otherwise qualify with the role and a short suffix.
    async fn qualified_hostname(&self, requested: &str, role: NodeRole) -> Result<String, ApiError> {
        let requested = requested.trim().to_lowercase();
        if requested.is_empty() {
            return Err(ApiError::bad_request("hostname must not be empty"));
        }
        if !unodes::hostname_taken(&self.db, &requested).await? {
            return Ok(requested);
        }
        let suffix = Self::random_token(4).to_lowercase();
        Ok(format!("{}-{}-{}", requested, role, suffix))
    }

    pub async fn heartbeat(
        &self,
        hostname: &str,
        request: HeartbeatRequest,
    ) -> Result<UNode, ApiError> {
        unodes::record_heartbeat(
            &self.db,
            hostname,
            &request.services_running,
            request.capabilities.as_ref(),
        )
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Unknown u-node '{}'", hostname)))
    }

    pub async fn list_nodes(&self) -> Result<Vec<(UNode, NodeLiveness)>, ApiError> {
        let nodes = unodes::list(&self.db).await?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let liveness = node.liveness(self.heartbeat_interval);
                (node, liveness)
            })
            .collect())
    }

    pub async fn get_node(&self, hostname: &str) -> Result<(UNode, NodeLiveness), ApiError> {
        let node = unodes::find_by_hostname(&self.db, hostname)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Unknown u-node '{}'", hostname)))?;
        let liveness = node.liveness(self.heartbeat_interval);
        Ok((node, liveness))
    }

    pub async fn remove_node(&self, hostname: &str) -> Result<(), ApiError> {
        if !unodes::remove(&self.db, hostname).await? {
            return Err(ApiError::not_found(format!("Unknown u-node '{}'", hostname)));
        }
        info!("u-node '{}' removed", hostname);
        Ok(())
    }

    /// Nodes eligible as deployment targets: joined and heartbeating.
    pub async fn available_targets(&self) -> Result<Vec<UNode>, ApiError> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|(_, liveness)| *liveness == NodeLiveness::Online)
            .map(|(node, _)| node)
            .collect())
    }

    /// Resolve a hostname to a node that can take a deployment now. A
    /// stale or lost node is reported as a transient backend condition so
    /// the client can retry once the node returns.
    pub async fn require_available(&self, hostname: &str) -> Result<UNode, ApiError> {
        let (node, liveness) = self.get_node(hostname).await?;
        if liveness != NodeLiveness::Online {
            return Err(ApiError::new(
                ErrorKind::BackendUnavailable,
                format!("u-node '{}' is {:?}", hostname, liveness),
            ));
        }
        Ok(node)
    }

    pub async fn purge_expired_tokens(&self) -> Result<u64, ApiError> {
        Ok(join_tokens::purge_expired(&self.db).await?)
    }

}

/// Bootstrap script served to prospective nodes and used as cloud
/// user-data: installs the container runtime and the overlay client,
/// starts the agent, then posts the join request.
pub fn join_script(public_url: &str, token: &str, agent_port: u16) -> String {
    format!(
        r#"#!/bin/bash
# ushadow u-node bootstrap
set -e

echo "=== ushadow u-node bootstrap ==="

echo "[1/4] Installing Docker..."
if ! command -v docker >/dev/null 2>&1; then
  curl -fsSL https://get.docker.com | sh
  systemctl enable docker
  systemctl start docker
fi

echo "[2/4] Installing Tailscale..."
if ! command -v tailscale >/dev/null 2>&1; then
  curl -fsSL https://tailscale.com/install.sh | sh
fi
tailscale up || true

echo "[3/4] Starting node agent..."
HOSTNAME=$(hostname)
OVERLAY_IP=$(tailscale ip -4 2>/dev/null | head -n1)
PUBLIC_IP=$(curl -fsS https://api.ipify.org 2>/dev/null || true)

echo "[4/4] Joining control plane..."
curl -fsS -X POST "{public_url}/api/nodes/join" \
  -H "X-Join-Token: {token}" \
  -H "Content-Type: application/json" \
  -d "{{\"hostname\": \"$HOSTNAME\", \"overlay_ip\": \"$OVERLAY_IP\", \"public_ip\": \"$PUBLIC_IP\", \"capabilities\": {{\"docker\": true}}}}"

echo ""
echo "Joined. Start the agent with:"
echo "  ushadow agent --server {public_url} --hostname $HOSTNAME --port {agent_port}"
"#,
        public_url = public_url.trim_end_matches('/'),
        token = token,
        agent_port = agent_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_accepts_unknown_fields() {
        let raw = serde_json::json!({
            "hostname": "worker-1",
            "status": "online",
            "services_running": ["nginx-abc12345"],
            "capabilities": { "docker": true, "cpu": 4 },
            "metrics": { "load": 0.2 },
            "some_future_field": { "nested": true },
        });
        let parsed: HeartbeatRequest = serde_json::from_value(raw).expect("forward compat");
        assert_eq!(parsed.services_running, vec!["nginx-abc12345".to_string()]);
        assert_eq!(parsed.status.as_deref(), Some("online"));
    }

    #[test]
    fn test_join_token_request_defaults() {
        let parsed: JoinTokenRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed.expires_in_hours, 24);
        assert_eq!(parsed.max_uses, 1);
        assert_eq!(parsed.role, NodeRole::Worker);
    }

    #[test]
    fn test_join_script_contents() {
        let script = join_script("http://leader:8010/", "tok-abc123", 8444);
        assert!(script.starts_with("#!/bin/bash"));
        // Trailing slash on the public URL is normalised away.
        assert!(script.contains("http://leader:8010/api/nodes/join"));
        assert!(script.contains("X-Join-Token: tok-abc123"));
        assert!(script.contains("--port 8444"));
        assert!(script.contains("get.docker.com"));
        assert!(script.contains("tailscale.com/install.sh"));
    }
}
