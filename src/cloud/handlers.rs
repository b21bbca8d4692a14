use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::cloud::manager::{ProvisionRequest, SaveCredentialsRequest};
use crate::db::models::User;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn save_credentials(
    State(state): State<AppState>,
    Json(request): Json<SaveCredentialsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider = request.provider.clone();
    state.cloud.save_credentials(request).await?;
    Ok(Json(json!({ "provider": provider, "saved": true })))
}

pub async fn list_providers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({ "providers": state.cloud.configured_providers() })))
}

pub async fn remove_credentials(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cloud.remove_credentials(&provider)?;
    Ok(Json(json!({ "provider": provider, "removed": true })))
}

pub async fn list_regions(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = provider
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let driver = state.cloud.provider_for(kind)?;
    let regions = driver.list_regions().await.map_err(|e| {
        ApiError::new(
            crate::error::ErrorKind::BackendUnavailable,
            format!("{:#}", e),
        )
    })?;
    Ok(Json(json!({ "regions": regions })))
}

pub async fn list_sizes(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = provider
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let driver = state.cloud.provider_for(kind)?;
    let sizes = driver.list_sizes().await.map_err(|e| {
        ApiError::new(
            crate::error::ErrorKind::BackendUnavailable,
            format!("{:#}", e),
        )
    })?;
    Ok(Json(json!({ "sizes": sizes })))
}

pub async fn recommended_size(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = provider
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let driver = state.cloud.provider_for(kind)?;
    let size = driver.get_recommended_size().await.map_err(|e| {
        ApiError::new(
            crate::error::ErrorKind::BackendUnavailable,
            format!("{:#}", e),
        )
    })?;
    Ok(Json(json!({ "size": size })))
}

pub async fn provision(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state
        .cloud
        .clone()
        .provision_node(request, Some(user.email.clone()))
        .await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instances = state.cloud.list_instances().await?;
    Ok(Json(json!({ "instances": instances })))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state.cloud.get_instance(&id).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cloud.start_instance(&id).await?;
    Ok(Json(json!({ "instance": id, "action": "start" })))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cloud.stop_instance(&id).await?;
    Ok(Json(json!({ "instance": id, "action": "stop" })))
}

pub async fn reboot_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cloud.reboot_instance(&id).await?;
    Ok(Json(json!({ "instance": id, "action": "reboot" })))
}

pub async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cloud.terminate_instance(&id).await?;
    Ok(Json(json!({ "instance": id, "terminated": true })))
}

pub async fn usage_summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.cloud.usage_summary().await?))
}

#[derive(Debug, Deserialize)]
pub struct EstimateQuery {
    pub provider: String,
    pub size: String,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

pub async fn estimate_cost(
    State(state): State<AppState>,
    Query(query): Query<EstimateQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let monthly = state
        .cloud
        .estimate_monthly_cost(&query.provider, &query.size, query.count)
        .await?;
    Ok(Json(json!({
        "provider": query.provider,
        "size": query.size,
        "count": query.count,
        "estimated_monthly": monthly,
    })))
}
