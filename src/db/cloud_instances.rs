use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::{CloudInstanceRow, UsageRecord};

const COLUMNS: &str = "id, name, provider, region, size, status, public_ipv4, public_ipv6, \
     private_ip, overlay_ip, hourly_cost, owner_email, unode_hostname, created_at, updated_at";

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    pool: &PgPool,
    id: &str,
    name: &str,
    provider: &str,
    region: &str,
    size: &str,
    status: &str,
    public_ipv4: Option<&str>,
    hourly_cost: f64,
    owner_email: Option<&str>,
) -> Result<CloudInstanceRow> {
    let row = sqlx::query_as::<_, CloudInstanceRow>(&format!(
        "INSERT INTO cloud_instances
             (id, name, provider, region, size, status, public_ipv4, hourly_cost, owner_email)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(name)
    .bind(provider)
    .bind(region)
    .bind(size)
    .bind(status)
    .bind(public_ipv4)
    .bind(hourly_cost)
    .bind(owner_email)
    .fetch_one(pool)
    .await
    .context("Failed to insert cloud instance")?;
    Ok(row)
}

pub async fn get(pool: &PgPool, id: &str) -> Result<Option<CloudInstanceRow>> {
    let row = sqlx::query_as::<_, CloudInstanceRow>(&format!(
        "SELECT {} FROM cloud_instances WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to get cloud instance")?;
    Ok(row)
}

pub async fn list(pool: &PgPool) -> Result<Vec<CloudInstanceRow>> {
    let rows = sqlx::query_as::<_, CloudInstanceRow>(&format!(
        "SELECT {} FROM cloud_instances ORDER BY created_at DESC",
        COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list cloud instances")?;
    Ok(rows)
}

pub async fn update_status(
    pool: &PgPool,
    id: &str,
    status: &str,
    public_ipv4: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE cloud_instances
         SET status = $2, public_ipv4 = COALESCE($3, public_ipv4), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .bind(public_ipv4)
    .execute(pool)
    .await
    .context("Failed to update cloud instance status")?;
    Ok(())
}

/// Correlate a freshly joined u-node with the instance that produced it.
pub async fn link_unode(
    pool: &PgPool,
    id: &str,
    unode_hostname: &str,
    overlay_ip: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE cloud_instances
         SET unode_hostname = $2, overlay_ip = COALESCE($3, overlay_ip), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(unode_hostname)
    .bind(overlay_ip)
    .execute(pool)
    .await
    .context("Failed to link unode to cloud instance")?;
    Ok(())
}

pub async fn find_by_public_ip(pool: &PgPool, ip: &str) -> Result<Option<CloudInstanceRow>> {
    let row = sqlx::query_as::<_, CloudInstanceRow>(&format!(
        "SELECT {} FROM cloud_instances WHERE public_ipv4 = $1 AND unode_hostname IS NULL",
        COLUMNS
    ))
    .bind(ip)
    .fetch_optional(pool)
    .await
    .context("Failed to find cloud instance by IP")?;
    Ok(row)
}

pub async fn remove(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM cloud_instances WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to remove cloud instance")?;
    Ok(result.rows_affected() > 0)
}

pub async fn record_usage(
    pool: &PgPool,
    instance_id: &str,
    provider: &str,
    event: &str,
    hourly_rate: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO usage_records (instance_id, provider, event, hourly_rate)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(instance_id)
    .bind(provider)
    .bind(event)
    .bind(hourly_rate)
    .execute(pool)
    .await
    .context("Failed to record usage event")?;
    Ok(())
}

pub async fn usage_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<UsageRecord>> {
    let records = sqlx::query_as::<_, UsageRecord>(
        "SELECT id, instance_id, provider, event, hourly_rate, recorded_at
         FROM usage_records
         WHERE recorded_at >= $1
         ORDER BY instance_id, recorded_at",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("Failed to load usage records")?;
    Ok(records)
}
