//! Kubernetes cluster registration.
//!
//! A cluster is registered by pasting a kubeconfig; the config is
//! validated by building a client against it, stored, and a virtual
//! `k8s` u-node is created so the cluster shows up in the fleet.

pub mod handlers;
pub mod routes;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use crate::db::clusters;
use crate::db::models::{Cluster, NodeRole};
use crate::db::unodes;
use crate::deployment::backend::KubernetesBackend;
use crate::error::{ApiError, ErrorKind};

fn short_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn virtual_node_hostname(cluster_id: &str) -> String {
    format!("k8s-{}", cluster_id)
}

/// Validate a kubeconfig, persist the cluster, and create its virtual
/// node.
pub async fn register_cluster(
    db: &PgPool,
    name: &str,
    kubeconfig: &str,
    default_namespace: &str,
) -> Result<Cluster, ApiError> {
    // The pasted config must at least produce a client; an unreachable
    // API server is tolerated so air-gapped setups can pre-register.
    KubernetesBackend::client_from_kubeconfig(kubeconfig)
        .await
        .map_err(|e| {
            ApiError::from_anyhow(e, ErrorKind::Validation, "Kubeconfig was rejected")
        })?;

    let id = short_id();
    let cluster = clusters::create(db, &id, name, kubeconfig, default_namespace).await?;

    unodes::create(
        db,
        &virtual_node_hostname(&id),
        None,
        NodeRole::K8s,
        &json!({ "kubernetes": true, "cluster_id": id }),
    )
    .await?;

    info!("cluster '{}' registered as {}", name, cluster.id);
    Ok(cluster)
}

pub async fn list_clusters(db: &PgPool) -> Result<Vec<Cluster>, ApiError> {
    Ok(clusters::list(db).await?)
}

/// Remove a cluster and cascade its virtual node.
pub async fn remove_cluster(db: &PgPool, cluster_id: &str) -> Result<(), ApiError> {
    if !clusters::remove(db, cluster_id).await? {
        return Err(ApiError::not_found(format!(
            "Cluster '{}' not registered",
            cluster_id
        )));
    }
    let _ = unodes::remove(db, &virtual_node_hostname(cluster_id)).await?;
    info!("cluster '{}' removed", cluster_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_hostname_shape() {
        assert_eq!(virtual_node_hostname("abc123"), "k8s-abc123");
    }

    #[test]
    fn test_short_ids_are_lowercase_alphanumeric() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
