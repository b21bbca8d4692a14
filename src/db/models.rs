use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Authenticated user. `password_hash` is set for local-mode accounts and
/// absent for principals provisioned from a federated identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

/// Deployment target discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    LocalDocker,
    DockerUnode,
    Kubernetes,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetType::LocalDocker => write!(f, "local_docker"),
            TargetType::DockerUnode => write!(f, "docker_unode"),
            TargetType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Deployment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removing,
    Removed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Removing => "removing",
            DeploymentStatus::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// An instance of a service definition placed on a target. The resolved
/// definition is snapshotted at deploy time so later registry edits do
/// not rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: String,
    pub target_type: TargetType,
    pub unode_hostname: Option<String>,
    pub cluster_id: Option<String>,
    pub namespace: Option<String>,
    pub status: DeploymentStatus,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub exposed_port: Option<i32>,
    pub access_url: Option<String>,
    pub error_message: Option<String>,
    pub resolved_definition: serde_json::Value,
    pub backend_metadata: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Worker node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Worker,
    K8s,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "leader"),
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::K8s => write!(f, "k8s"),
        }
    }
}

/// Heartbeat-derived liveness, computed from `last_heartbeat` on read so
/// no sweeper task has to race the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLiveness {
    Online,
    Stale,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UNode {
    pub id: Uuid,
    pub hostname: String,
    pub overlay_ip: Option<String>,
    pub role: NodeRole,
    pub capabilities: serde_json::Value,
    pub services_running: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UNode {
    /// Online within 3 heartbeat intervals, stale within 10, lost after.
    /// Virtual k8s nodes do not heartbeat and count as online.
    pub fn liveness(&self, heartbeat_interval: Duration) -> NodeLiveness {
        if self.role == NodeRole::K8s {
            return NodeLiveness::Online;
        }
        let silence = Utc::now().signed_duration_since(self.last_heartbeat);
        if silence <= heartbeat_interval * 3 {
            NodeLiveness::Online
        } else if silence <= heartbeat_interval * 10 {
            NodeLiveness::Stale
        } else {
            NodeLiveness::Lost
        }
    }
}

/// Bounded-use credential for node registration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JoinToken {
    pub token: String,
    pub role: NodeRole,
    pub expires_at: DateTime<Utc>,
    pub remaining_uses: i32,
    pub created_at: DateTime<Utc>,
}

impl JoinToken {
    pub fn usable(&self) -> bool {
        self.remaining_uses > 0 && self.expires_at > Utc::now()
    }
}

/// Registered Kubernetes cluster; backs one virtual k8s u-node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub kubeconfig: String,
    pub default_namespace: String,
    pub created_at: DateTime<Utc>,
}

/// A VM created through a cloud driver.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CloudInstanceRow {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub region: String,
    pub size: String,
    pub status: String,
    pub public_ipv4: Option<String>,
    pub public_ipv6: Option<String>,
    pub private_ip: Option<String>,
    pub overlay_ip: Option<String>,
    pub hourly_cost: f64,
    pub owner_email: Option<String>,
    pub unode_hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One lifecycle transition of a cloud instance, for cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub instance_id: String,
    pub provider: String,
    pub event: String,
    pub hourly_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(last_heartbeat: DateTime<Utc>, role: NodeRole) -> UNode {
        UNode {
            id: Uuid::new_v4(),
            hostname: "worker-1".into(),
            overlay_ip: Some("100.64.0.2".into()),
            role,
            capabilities: serde_json::json!({}),
            services_running: vec![],
            last_heartbeat,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_liveness_thresholds() {
        let interval = Duration::seconds(15);
        let now = Utc::now();
        assert_eq!(
            node(now, NodeRole::Worker).liveness(interval),
            NodeLiveness::Online
        );
        assert_eq!(
            node(now - Duration::seconds(44), NodeRole::Worker).liveness(interval),
            NodeLiveness::Online
        );
        assert_eq!(
            node(now - Duration::seconds(46), NodeRole::Worker).liveness(interval),
            NodeLiveness::Stale
        );
        assert_eq!(
            node(now - Duration::seconds(151), NodeRole::Worker).liveness(interval),
            NodeLiveness::Lost
        );
    }

    #[test]
    fn test_k8s_nodes_do_not_go_stale() {
        let interval = Duration::seconds(15);
        let old = Utc::now() - Duration::days(7);
        assert_eq!(node(old, NodeRole::K8s).liveness(interval), NodeLiveness::Online);
    }

    #[test]
    fn test_join_token_usability() {
        let token = JoinToken {
            token: "t".into(),
            role: NodeRole::Worker,
            expires_at: Utc::now() + Duration::hours(1),
            remaining_uses: 1,
            created_at: Utc::now(),
        };
        assert!(token.usable());
        let spent = JoinToken {
            remaining_uses: 0,
            ..token.clone()
        };
        assert!(!spent.usable());
        let expired = JoinToken {
            expires_at: Utc::now() - Duration::hours(1),
            ..token
        };
        assert!(!expired.usable());
    }
}
