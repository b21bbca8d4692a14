use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::{JoinToken, NodeRole};

const COLUMNS: &str = "token, role, expires_at, remaining_uses, created_at";

pub async fn create(
    pool: &PgPool,
    token: &str,
    role: NodeRole,
    expires_at: DateTime<Utc>,
    max_uses: i32,
) -> Result<JoinToken> {
    let join_token = sqlx::query_as::<_, JoinToken>(&format!(
        "INSERT INTO join_tokens (token, role, expires_at, remaining_uses)
         VALUES ($1, $2, $3, $4)
         RETURNING {}",
        COLUMNS
    ))
    .bind(token)
    .bind(role)
    .bind(expires_at)
    .bind(max_uses)
    .fetch_one(pool)
    .await
    .context("Failed to create join token")?;
    Ok(join_token)
}

/// Atomically consume one use of a token. Returns the token row only if
/// it was still valid; a spent or expired token yields None, so a token
/// with max_uses = 1 admits exactly one redemption even under races.
pub async fn redeem(pool: &PgPool, token: &str) -> Result<Option<JoinToken>> {
    let redeemed = sqlx::query_as::<_, JoinToken>(&format!(
        "UPDATE join_tokens
         SET remaining_uses = remaining_uses - 1
         WHERE token = $1 AND remaining_uses > 0 AND expires_at > NOW()
         RETURNING {}",
        COLUMNS
    ))
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to redeem join token")?;
    Ok(redeemed)
}

pub async fn purge_expired(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM join_tokens WHERE expires_at < NOW()")
        .execute(pool)
        .await
        .context("Failed to purge expired join tokens")?;
    Ok(result.rows_affected())
}
