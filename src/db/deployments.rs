use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{Deployment, DeploymentStatus, TargetType};

const COLUMNS: &str = "id, service_id, target_type, unode_hostname, cluster_id, namespace, \
     status, container_id, container_name, exposed_port, access_url, error_message, \
     resolved_definition, backend_metadata, created_by, created_at, updated_at, \
     deployed_at, stopped_at";

/// States that still occupy the target; a second deploy of the same
/// service to the same target while one of these exists is a conflict.
pub const ACTIVE_STATUSES: &[DeploymentStatus] = &[
    DeploymentStatus::Pending,
    DeploymentStatus::Deploying,
    DeploymentStatus::Running,
    DeploymentStatus::Stopping,
];

fn status_strings(statuses: &[DeploymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    service_id: &str,
    target_type: TargetType,
    unode_hostname: Option<&str>,
    cluster_id: Option<&str>,
    namespace: Option<&str>,
    resolved_definition: &serde_json::Value,
    created_by: Option<&str>,
) -> Result<Deployment> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "INSERT INTO deployments
             (service_id, target_type, unode_hostname, cluster_id, namespace,
              status, resolved_definition, created_by)
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
         RETURNING {}",
        COLUMNS
    ))
    .bind(service_id)
    .bind(target_type)
    .bind(unode_hostname)
    .bind(cluster_id)
    .bind(namespace)
    .bind(resolved_definition)
    .bind(created_by)
    .fetch_one(pool)
    .await
    .context("Failed to create deployment")?;
    Ok(deployment)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {} FROM deployments WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find deployment")?;
    Ok(deployment)
}

pub async fn list(pool: &PgPool) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {} FROM deployments ORDER BY created_at DESC",
        COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list deployments")?;
    Ok(deployments)
}

pub async fn list_by_status(pool: &PgPool, status: DeploymentStatus) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {} FROM deployments WHERE status = $1 ORDER BY created_at DESC",
        COLUMNS
    ))
    .bind(status)
    .fetch_all(pool)
    .await
    .context("Failed to list deployments by status")?;
    Ok(deployments)
}

/// Active deployment of a service on a specific target, if any. The
/// query matches the stored columns literally, so callers must pass the
/// canonical target identity (the engine's `canonical_target`) — a
/// docker_unode spelling of the local host never reaches this query.
pub async fn find_active_for_target(
    pool: &PgPool,
    service_id: &str,
    target_type: TargetType,
    unode_hostname: Option<&str>,
    cluster_id: Option<&str>,
    namespace: Option<&str>,
) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {} FROM deployments
         WHERE service_id = $1
           AND target_type = $2
           AND unode_hostname IS NOT DISTINCT FROM $3
           AND cluster_id IS NOT DISTINCT FROM $4
           AND namespace IS NOT DISTINCT FROM $5
           AND status = ANY($6)
         ORDER BY created_at DESC
         LIMIT 1",
        COLUMNS
    ))
    .bind(service_id)
    .bind(target_type)
    .bind(unode_hostname)
    .bind(cluster_id)
    .bind(namespace)
    .bind(status_strings(ACTIVE_STATUSES))
    .fetch_optional(pool)
    .await
    .context("Failed to find active deployment for target")?;
    Ok(deployment)
}

/// Active deployments of a service on any target.
pub async fn find_active_for_service(
    pool: &PgPool,
    service_id: &str,
) -> Result<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(&format!(
        "SELECT {} FROM deployments
         WHERE service_id = $1 AND status = ANY($2)
         ORDER BY created_at DESC",
        COLUMNS
    ))
    .bind(service_id)
    .bind(status_strings(ACTIVE_STATUSES))
    .fetch_all(pool)
    .await
    .context("Failed to find active deployments for service")?;
    Ok(deployments)
}

/// Unconditional status write; timestamps track the state reached.
pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    status: DeploymentStatus,
) -> Result<Deployment> {
    let deployed_at = matches!(status, DeploymentStatus::Running).then(Utc::now);
    let stopped_at = matches!(
        status,
        DeploymentStatus::Stopped | DeploymentStatus::Failed | DeploymentStatus::Removed
    )
    .then(Utc::now);

    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments
         SET status = $2,
             updated_at = NOW(),
             deployed_at = COALESCE($3, deployed_at),
             stopped_at = COALESCE($4, stopped_at)
         WHERE id = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(status)
    .bind(deployed_at)
    .bind(stopped_at)
    .fetch_one(pool)
    .await
    .context("Failed to update deployment status")?;
    Ok(deployment)
}

/// Compare-and-set transition: succeeds only while the row is still in
/// one of the expected states. Returns None when another writer won.
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    expected: &[DeploymentStatus],
    to: DeploymentStatus,
) -> Result<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments
         SET status = $3, updated_at = NOW()
         WHERE id = $1 AND status = ANY($2)
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(status_strings(expected))
    .bind(to)
    .fetch_optional(pool)
    .await
    .context("Failed to transition deployment")?;
    Ok(deployment)
}

/// Record what the backend produced for a deployment.
pub async fn set_backend_result(
    pool: &PgPool,
    id: Uuid,
    container_id: Option<&str>,
    container_name: Option<&str>,
    exposed_port: Option<i32>,
    access_url: Option<&str>,
    backend_metadata: &serde_json::Value,
) -> Result<Deployment> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments
         SET container_id = COALESCE($2, container_id),
             container_name = COALESCE($3, container_name),
             exposed_port = COALESCE($4, exposed_port),
             access_url = COALESCE($5, access_url),
             backend_metadata = $6,
             updated_at = NOW()
         WHERE id = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(container_id)
    .bind(container_name)
    .bind(exposed_port)
    .bind(access_url)
    .bind(backend_metadata)
    .fetch_one(pool)
    .await
    .context("Failed to record backend result")?;
    Ok(deployment)
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<Deployment> {
    let deployment = sqlx::query_as::<_, Deployment>(&format!(
        "UPDATE deployments
         SET status = 'failed', error_message = $2, stopped_at = NOW(), updated_at = NOW()
         WHERE id = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("Failed to mark deployment failed")?;
    Ok(deployment)
}

pub async fn set_access_url(pool: &PgPool, id: Uuid, access_url: &str) -> Result<()> {
    sqlx::query("UPDATE deployments SET access_url = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(access_url)
        .execute(pool)
        .await
        .context("Failed to set access url")?;
    Ok(())
}
