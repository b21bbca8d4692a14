use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::middleware::{clear_session_cookie, session_cookie};
use crate::auth::password::{hash_password, verify_password};
use crate::db::models::User;
use crate::db::users;
use crate::error::{ApiError, ApiErrorExt, ErrorKind};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: u64,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub email: String,
    pub password: String,
    pub confirm: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenExchangeRequest {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ServiceTokenRequest {
    #[serde(default)]
    pub audience: Vec<String>,
}

fn login_response(
    state: &AppState,
    user: User,
) -> Result<(HeaderMap, Json<LoginResponse>), ApiError> {
    let (token, expires_at) = state
        .jwt
        .sign_user_token(&user)
        .api_err(ErrorKind::Internal, "Failed to sign token")?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        session_cookie(&token)
            .parse()
            .map_err(|_| ApiError::internal("Failed to build session cookie"))?,
    );

    Ok((
        headers,
        Json(LoginResponse {
            access_token: token,
            token_type: "bearer",
            expires_at,
            user,
        }),
    ))
}

/// Password login against the local user collection. Sets the HTTP-only
/// session cookie and returns the JWT for API clients.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<LoginResponse>), ApiError> {
    let user = users::find_by_email(&state.db, &request.email)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid email or password"))?;

    let hash = user
        .password_hash
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("Account has no local password"))?;
    if !verify_password(hash, &request.password) {
        return Err(ApiError::unauthorized("Invalid email or password"));
    }

    login_response(&state, user)
}

pub async fn setup_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = users::count(&state.db).await?;
    Ok(Json(json!({ "setup_complete": count > 0 })))
}

/// First-run administrator creation. 409 once any user exists.
pub async fn setup(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<(HeaderMap, Json<LoginResponse>), ApiError> {
    if users::count(&state.db).await? > 0 {
        return Err(ApiError::conflict("Setup has already been completed"));
    }
    if request.password != request.confirm {
        return Err(ApiError::bad_request("Passwords do not match"));
    }
    if request.password.len() < 8 {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters",
        ));
    }
    if !request.email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address"));
    }

    let hash = hash_password(&request.password)
        .api_err(ErrorKind::Internal, "Failed to hash password")?;
    let user = users::create(
        &state.db,
        &request.email,
        request.display_name.as_deref(),
        Some(&hash),
        &["admin".to_string()],
    )
    .await?;

    tracing::info!("initial administrator '{}' created", user.email);
    login_response(&state, user)
}

pub async fn me(Extension(user): Extension<User>) -> Json<User> {
    Json(user)
}

pub async fn logout() -> Result<(HeaderMap, Json<serde_json::Value>), ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        clear_session_cookie()
            .parse()
            .map_err(|_| ApiError::internal("Failed to build cookie"))?,
    );
    Ok((headers, Json(json!({ "logged_out": true }))))
}

/// OIDC authorization-code exchange (PKCE). The provider's client secret
/// stays on the backend.
pub async fn exchange_token(
    State(state): State<AppState>,
    Json(request): Json<TokenExchangeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let oidc = state.oidc.as_ref().ok_or_else(|| {
        ApiError::bad_request("No OIDC provider is configured")
    })?;
    let tokens = oidc
        .exchange_code(&request.code, &request.code_verifier, &request.redirect_uri)
        .await
        .api_err(ErrorKind::Authentication, "Code exchange failed")?;
    Ok(Json(serde_json::to_value(tokens).unwrap_or_default()))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let oidc = state.oidc.as_ref().ok_or_else(|| {
        ApiError::bad_request("No OIDC provider is configured")
    })?;
    let tokens = oidc
        .refresh(&request.refresh_token)
        .await
        .api_err(ErrorKind::Authentication, "Token refresh failed")?;
    Ok(Json(serde_json::to_value(tokens).unwrap_or_default()))
}

/// Mint a short-lived ushadow-issued JWT carrying the caller's identity
/// for onward calls to subsystems that only accept local tokens.
pub async fn service_token(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<ServiceTokenRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (token, expires_at) = state
        .jwt
        .sign_service_token(
            &user.id.to_string(),
            &user.email,
            &user.roles,
            request.audience,
        )
        .api_err(ErrorKind::Internal, "Failed to sign service token")?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "access_token": token,
            "token_type": "bearer",
            "expires_at": expires_at,
        })),
    ))
}
