use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::User;

const COLUMNS: &str =
    "id, email, display_name, password_hash, roles, created_at, updated_at";

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users WHERE email = $1",
        COLUMNS
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
    .context("Failed to find user by email")?;
    Ok(user)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to find user by id")?;
    Ok(user)
}

pub async fn count(pool: &PgPool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("Failed to count users")?;
    Ok(count)
}

pub async fn create(
    pool: &PgPool,
    email: &str,
    display_name: Option<&str>,
    password_hash: Option<&str>,
    roles: &[String],
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (email, display_name, password_hash, roles)
         VALUES ($1, $2, $3, $4)
         RETURNING {}",
        COLUMNS
    ))
    .bind(email)
    .bind(display_name)
    .bind(password_hash)
    .bind(roles)
    .fetch_one(pool)
    .await
    .context("Failed to create user")?;
    Ok(user)
}

/// Look up a user by email, provisioning a password-less record for
/// principals arriving through the federated identity provider.
pub async fn find_or_create(pool: &PgPool, email: &str) -> Result<User> {
    if let Some(user) = find_by_email(pool, email).await? {
        return Ok(user);
    }
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (email, roles)
         VALUES ($1, '{{}}')
         ON CONFLICT (email) DO UPDATE SET updated_at = NOW()
         RETURNING {}",
        COLUMNS
    ))
    .bind(email)
    .fetch_one(pool)
    .await
    .context("Failed to find or create user")?;
    Ok(user)
}
