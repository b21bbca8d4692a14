use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterClusterRequest {
    pub name: String,
    pub kubeconfig: String,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

pub async fn register_cluster(
    State(state): State<AppState>,
    Json(request): Json<RegisterClusterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let cluster = super::register_cluster(
        &state.db,
        &request.name,
        &request.kubeconfig,
        &request.default_namespace,
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "cluster_id": cluster.id,
            "name": cluster.name,
            "default_namespace": cluster.default_namespace,
        })),
    ))
}

pub async fn list_clusters(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let clusters = super::list_clusters(&state.db).await?;
    Ok(Json(json!({ "clusters": clusters })))
}

pub async fn remove_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    super::remove_cluster(&state.db, &id).await?;
    Ok(Json(json!({ "removed": id })))
}
