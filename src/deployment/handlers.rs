use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::TcpListener;
use uuid::Uuid;

use crate::db::models::{DeploymentStatus, TargetType, User};
use crate::db::deployments;
use crate::deployment::models::DeployRequest;
use crate::error::ApiError;
use crate::state::AppState;

/// Deployments are returned with the secret-masking pass applied: the
/// resolved environment snapshot may carry credential values.
fn masked(deployment: &crate::db::models::Deployment) -> serde_json::Value {
    crate::config_store::mask_json_secrets(
        &serde_json::to_value(deployment).unwrap_or_default(),
    )
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state
        .engine
        .clone()
        .deploy(request, Some(user.email.clone()))
        .await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

pub async fn list_deployments(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployments = state.engine.list().await?;
    let deployments: Vec<serde_json::Value> = deployments.iter().map(masked).collect();
    Ok(Json(json!({ "deployments": deployments })))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.engine.get(id).await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

/// Status endpoint delegates to the backend (rate-limited in the engine)
/// so callers can poll.
pub async fn refresh_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.engine.status(id).await?;
    Ok(Json(json!({
        "id": deployment.id,
        "status": deployment.status,
        "access_url": deployment.access_url,
        "error_message": deployment.error_message,
    })))
}

pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.engine.stop(id).await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.engine.remove(id).await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: i64,
}

fn default_tail() -> i64 {
    100
}

pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let logs = state.engine.logs(id, query.tail).await?;
    Ok(Json(json!({ "logs": logs })))
}

#[derive(Debug, Deserialize)]
pub struct DeployAllRequest {
    pub service_ids: Vec<String>,
}

pub async fn deploy_all(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<DeployAllRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployments = state
        .engine
        .clone()
        .deploy_all(request.service_ids, Some(user.email.clone()))
        .await?;
    let deployments: Vec<serde_json::Value> = deployments.iter().map(masked).collect();
    Ok(Json(json!({ "deployments": deployments })))
}

#[derive(Debug, Serialize)]
struct ServiceListing {
    id: String,
    display_name: String,
    description: Option<String>,
    image: String,
    infrastructure: bool,
    imported: bool,
    installed: bool,
    enabled: bool,
    requires: Vec<String>,
    provides: Vec<String>,
}

/// Installed/enabled flags: every discovered definition is installed;
/// enabled means an active deployment exists somewhere.
pub async fn list_services(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut listings = Vec::new();
    for service in state.registry.all_services() {
        let active = deployments::find_active_for_service(&state.db, &service.id).await?;
        listings.push(ServiceListing {
            id: service.id.clone(),
            display_name: service
                .display_name
                .clone()
                .unwrap_or_else(|| service.service_name.clone()),
            description: service.description.clone(),
            image: service.image.clone(),
            infrastructure: service.infrastructure,
            imported: service.github.is_some(),
            installed: true,
            enabled: !active.is_empty(),
            requires: service.requires.clone(),
            provides: service.provides.clone(),
        });
    }
    Ok(Json(json!({ "services": listings })))
}

fn local_deploy_request(service_id: String) -> DeployRequest {
    DeployRequest {
        service_id,
        target_type: TargetType::LocalDocker,
        unode_hostname: None,
        cluster_id: None,
        namespace: None,
        replicas: None,
        service_type: None,
        ingress_host: None,
    }
}

pub async fn start_service(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(service_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state
        .engine
        .clone()
        .deploy(local_deploy_request(service_id), Some(user.email.clone()))
        .await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

/// Stop every active local deployment of the service.
pub async fn stop_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = deployments::find_active_for_service(&state.db, &service_id).await?;
    if active.is_empty() {
        return Err(ApiError::not_found(format!(
            "No active deployment for service '{}'",
            service_id
        )));
    }
    let mut stopped = Vec::new();
    for deployment in active {
        stopped.push(masked(&state.engine.stop(deployment.id).await?));
    }
    Ok(Json(json!({ "deployments": stopped })))
}

pub async fn restart_service(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(service_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = deployments::find_active_for_service(&state.db, &service_id).await?;
    for deployment in active {
        state.engine.stop(deployment.id).await?;
    }
    let deployment = state
        .engine
        .clone()
        .deploy(local_deploy_request(service_id), Some(user.email.clone()))
        .await?;
    Ok(Json(json!({ "deployment": masked(&deployment) })))
}

/// Port preflight: is the primary host port free, and if not, what
/// nearby port would work.
pub async fn preflight(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let service = state
        .registry
        .get(&service_id)
        .ok_or_else(|| ApiError::not_found(format!("Service '{}' not found", service_id)))?;

    let Some((Some(host_port), _)) = service.primary_port() else {
        return Ok(Json(json!({
            "service_id": service_id,
            "port": null,
            "available": true,
            "conflicts": [],
        })));
    };

    let available = port_free(host_port);
    let suggested = if available {
        None
    } else {
        (host_port + 1..host_port.saturating_add(100)).find(|p| port_free(*p))
    };

    Ok(Json(json!({
        "service_id": service_id,
        "port": host_port,
        "available": available,
        "suggested_port": suggested,
        "conflicts": if available { vec![] } else { vec![host_port] },
    })))
}

fn port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Expose the state machine enum to clients that want to render it.
pub async fn deployment_states() -> Json<serde_json::Value> {
    Json(json!({
        "states": [
            DeploymentStatus::Pending,
            DeploymentStatus::Deploying,
            DeploymentStatus::Running,
            DeploymentStatus::Stopping,
            DeploymentStatus::Stopped,
            DeploymentStatus::Failed,
            DeploymentStatus::Removing,
            DeploymentStatus::Removed,
        ]
    }))
}
