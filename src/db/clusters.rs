use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::Cluster;

const COLUMNS: &str = "id, name, kubeconfig, default_namespace, created_at";

pub async fn create(
    pool: &PgPool,
    id: &str,
    name: &str,
    kubeconfig: &str,
    default_namespace: &str,
) -> Result<Cluster> {
    let cluster = sqlx::query_as::<_, Cluster>(&format!(
        "INSERT INTO clusters (id, name, kubeconfig, default_namespace)
         VALUES ($1, $2, $3, $4)
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(name)
    .bind(kubeconfig)
    .bind(default_namespace)
    .fetch_one(pool)
    .await
    .context("Failed to register cluster")?;
    Ok(cluster)
}

pub async fn get(pool: &PgPool, id: &str) -> Result<Option<Cluster>> {
    let cluster = sqlx::query_as::<_, Cluster>(&format!(
        "SELECT {} FROM clusters WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to get cluster")?;
    Ok(cluster)
}

pub async fn list(pool: &PgPool) -> Result<Vec<Cluster>> {
    let clusters = sqlx::query_as::<_, Cluster>(&format!(
        "SELECT {} FROM clusters ORDER BY created_at",
        COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list clusters")?;
    Ok(clusters)
}

pub async fn remove(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM clusters WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to remove cluster")?;
    Ok(result.rows_affected() > 0)
}
