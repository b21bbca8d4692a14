use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose, Engine as _};
use jsonwebtoken::decode_header;
use serde::Deserialize;

use crate::auth::jwt::ISSUER;
use crate::db::users;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "ushadow_token";

/// Extract Bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers.get("Authorization")?.to_str().ok()?;
    if !auth_header.starts_with("Bearer ") {
        return None;
    }
    Some(auth_header[7..].to_string())
}

/// Extract the session JWT from the HTTP-only cookie.
fn extract_cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get("Cookie")?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(&format!("{}=", SESSION_COOKIE)) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Minimal claims structure just to peek at the issuer.
#[derive(Debug, Deserialize)]
struct MinimalClaims {
    iss: String,
}

/// Decode the payload without validation to learn which validator to
/// route the token to.
fn peek_issuer(token: &str) -> Result<String, (StatusCode, String)> {
    decode_header(token).map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            format!("Invalid token format: {}", e),
        )
    })?;

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err((StatusCode::UNAUTHORIZED, "Invalid JWT format".to_string()));
    }
    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token encoding".to_string()))?;
    let claims: MinimalClaims = serde_json::from_slice(&decoded)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token claims".to_string()))?;
    Ok(claims.iss)
}

/// Authentication middleware: validates the bearer token (or session
/// cookie) and injects the User into request extensions.
///
/// Routing: when an OIDC provider is configured and enabled, tokens from
/// its issuer are tried first against its JWKS; ushadow-issued JWTs are
/// the fallback. With no provider, only local validation runs.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let token = extract_cookie_token(&headers)
        .or_else(|| extract_bearer_token(&headers))
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                "Missing authentication token (cookie or Authorization header)".to_string(),
            )
        })?;

    let issuer = peek_issuer(&token)?;

    let user = if let (Some(oidc), Some(validator)) = (&state.oidc, &state.oidc_validator) {
        if issuer == oidc.issuer() {
            // Federated path first when configured and enabled.
            let claims = validator.validate(&token).await.map_err(|e| {
                tracing::warn!("external token validation failed: {:#}", e);
                (StatusCode::UNAUTHORIZED, format!("Invalid token: {}", e))
            })?;
            let email = claims
                .get("email")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    (
                        StatusCode::UNAUTHORIZED,
                        "Token carries no email claim".to_string(),
                    )
                })?;
            users::find_or_create(&state.db, email).await.map_err(|e| {
                tracing::error!("failed to find/create user: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            })?
        } else {
            validate_local(&state, &token, &issuer).await?
        }
    } else {
        validate_local(&state, &token, &issuer).await?
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

async fn validate_local(
    state: &AppState,
    token: &str,
    issuer: &str,
) -> Result<crate::db::models::User, (StatusCode, String)> {
    if issuer != ISSUER {
        return Err((
            StatusCode::UNAUTHORIZED,
            format!("Unknown token issuer '{}'", issuer),
        ));
    }
    let claims = state.jwt.verify(token).map_err(|e| {
        tracing::warn!("local token validation failed: {:#}", e);
        (StatusCode::UNAUTHORIZED, format!("Invalid token: {}", e))
    })?;

    users::find_or_create(&state.db, &claims.email)
        .await
        .map_err(|e| {
            tracing::error!("failed to find/create user: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            )
        })
}

/// Session cookie value for a freshly minted token.
pub fn session_cookie(token: &str) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax",
        SESSION_COOKIE, token
    )
}

/// Expired cookie used on logout.
pub fn clear_session_cookie() -> String {
    format!(
        "{}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0",
        SESSION_COOKIE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_static("Bearer my-token-here"),
        );
        assert_eq!(
            extract_bearer_token(&headers),
            Some("my-token-here".to_string())
        );
    }

    #[test]
    fn test_extract_bearer_token_invalid_format() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic user:pass"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_cookie_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Cookie",
            HeaderValue::from_static("other=1; ushadow_token=abc.def.ghi; more=2"),
        );
        assert_eq!(
            extract_cookie_token(&headers),
            Some("abc.def.ghi".to_string())
        );
    }

    #[test]
    fn test_peek_issuer_rejects_garbage() {
        assert!(peek_issuer("not-a-jwt").is_err());
        assert!(peek_issuer("a.b").is_err());
    }
}
