use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::{NodeRole, UNode};

const COLUMNS: &str = "id, hostname, overlay_ip, role, capabilities, services_running, \
     last_heartbeat, created_at, updated_at";

pub async fn create(
    pool: &PgPool,
    hostname: &str,
    overlay_ip: Option<&str>,
    role: NodeRole,
    capabilities: &serde_json::Value,
) -> Result<UNode> {
    let node = sqlx::query_as::<_, UNode>(&format!(
        "INSERT INTO unodes (hostname, overlay_ip, role, capabilities)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (hostname) DO UPDATE
             SET overlay_ip = EXCLUDED.overlay_ip,
                 role = EXCLUDED.role,
                 capabilities = EXCLUDED.capabilities,
                 last_heartbeat = NOW(),
                 updated_at = NOW()
         RETURNING {}",
        COLUMNS
    ))
    .bind(hostname)
    .bind(overlay_ip)
    .bind(role)
    .bind(capabilities)
    .fetch_one(pool)
    .await
    .context("Failed to create unode")?;
    Ok(node)
}

pub async fn find_by_hostname(pool: &PgPool, hostname: &str) -> Result<Option<UNode>> {
    let node = sqlx::query_as::<_, UNode>(&format!(
        "SELECT {} FROM unodes WHERE hostname = $1",
        COLUMNS
    ))
    .bind(hostname)
    .fetch_optional(pool)
    .await
    .context("Failed to find unode")?;
    Ok(node)
}

pub async fn list(pool: &PgPool) -> Result<Vec<UNode>> {
    let nodes = sqlx::query_as::<_, UNode>(&format!(
        "SELECT {} FROM unodes ORDER BY hostname",
        COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list unodes")?;
    Ok(nodes)
}

/// Heartbeat upsert: last-writer-wins on the timestamp; the services list
/// and capabilities are replaced wholesale so reads see one consistent
/// snapshot.
pub async fn record_heartbeat(
    pool: &PgPool,
    hostname: &str,
    services_running: &[String],
    capabilities: Option<&serde_json::Value>,
) -> Result<Option<UNode>> {
    let node = sqlx::query_as::<_, UNode>(&format!(
        "UPDATE unodes
         SET last_heartbeat = NOW(),
             services_running = $2,
             capabilities = COALESCE($3, capabilities),
             updated_at = NOW()
         WHERE hostname = $1
         RETURNING {}",
        COLUMNS
    ))
    .bind(hostname)
    .bind(services_running)
    .bind(capabilities)
    .fetch_optional(pool)
    .await
    .context("Failed to record heartbeat")?;
    Ok(node)
}

pub async fn remove(pool: &PgPool, hostname: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM unodes WHERE hostname = $1")
        .bind(hostname)
        .execute(pool)
        .await
        .context("Failed to remove unode")?;
    Ok(result.rows_affected() > 0)
}

/// Whether a hostname is already taken, for role-qualified remapping.
pub async fn hostname_taken(pool: &PgPool, hostname: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM unodes WHERE hostname = $1")
        .bind(hostname)
        .fetch_one(pool)
        .await
        .context("Failed to check hostname")?;
    Ok(count > 0)
}
