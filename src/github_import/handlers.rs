use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::error::{ApiError, ApiErrorExt, ErrorKind};
use crate::state::AppState;

fn default_ref() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub repo: String,
    #[serde(default = "default_ref", rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    pub repo: String,
    pub path: String,
    #[serde(default = "default_ref", rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub repo: String,
    pub path: String,
    #[serde(default = "default_ref", rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub async fn scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state
        .github
        .scan(&request.repo, &request.git_ref)
        .await
        .api_err(ErrorKind::BackendUnavailable, "GitHub scan failed")?;
    Ok(Json(json!({
        "repo": request.repo,
        "ref": request.git_ref,
        "compose_files": files,
    })))
}

pub async fn parse(
    State(state): State<AppState>,
    Json(request): Json<ParseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state
        .github
        .parse(&request.repo, &request.git_ref, &request.path)
        .await
        .api_err(ErrorKind::Validation, "Compose file could not be parsed")?;
    Ok(Json(json!({
        "repo": request.repo,
        "path": request.path,
        "services": services,
    })))
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state
        .github
        .register(
            &request.repo,
            &request.git_ref,
            &request.path,
            request.name.as_deref(),
            request.env,
        )
        .await
        .api_err(ErrorKind::Validation, "Import registration failed")?;
    Ok(Json(json!({ "registered": services })))
}

pub async fn imported(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state.github.imported();
    Ok(Json(json!({ "imported": services })))
}

pub async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ConfigUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .github
        .update_config(&id, request.env)
        .api_err(ErrorKind::Validation, "Config update failed")?;
    Ok(Json(json!({ "updated": id })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .github
        .delete(&id)
        .api_err(ErrorKind::Validation, "Delete failed")?;
    Ok(Json(json!({ "deleted": id })))
}
