use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::nodes::manager::{HeartbeatRequest, JoinNodeRequest, JoinTokenRequest};
use crate::state::AppState;

pub const JOIN_TOKEN_HEADER: &str = "X-Join-Token";
pub const NODE_SECRET_HEADER: &str = "X-Node-Secret";

fn header_value(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| ApiError::unauthorized(format!("Missing {} header", name)))
}

pub async fn create_join_token(
    State(state): State<AppState>,
    Json(request): Json<JoinTokenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state.nodes.create_join_token(request).await?;
    let join_url = format!(
        "{}/api/nodes/join-script?token={}",
        state.settings.server.public_url.trim_end_matches('/'),
        token.token
    );
    Ok(Json(json!({
        "token": token.token,
        "role": token.role,
        "expires_at": token.expires_at,
        "remaining_uses": token.remaining_uses,
        "join_url": join_url,
    })))
}

/// Node registration. Returns 201 with the (possibly remapped) hostname
/// the node must use from now on.
pub async fn join(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JoinNodeRequest>,
) -> Result<(axum::http::StatusCode, Json<serde_json::Value>), ApiError> {
    let token = header_value(&headers, JOIN_TOKEN_HEADER)?;
    let public_ip = request.public_ip.clone();
    let node = state.nodes.redeem_join(&token, request).await?;

    // Correlate cloud-provisioned instances by their public IP so the
    // instance row and the node record end up linked.
    if let Some(ip) = public_ip {
        if let Err(e) = state
            .cloud
            .link_instance_by_public_ip(&ip, &node.hostname, node.overlay_ip.as_deref())
            .await
        {
            tracing::warn!("cloud linkage for {} failed: {}", node.hostname, e.message);
        }
    }

    let node_secret = state.nodes.node_secret()?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "node": node,
            "status": "online",
            "node_secret": node_secret,
            "heartbeat_interval_secs": state.settings.nodes.heartbeat_interval_secs,
        })),
    ))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let secret = header_value(&headers, NODE_SECRET_HEADER)?;
    state.nodes.verify_node_secret(&secret)?;

    // The body carries the hostname plus status fields; unknown fields
    // are tolerated.
    let hostname = payload
        .get("hostname")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("heartbeat requires a hostname"))?
        .to_string();
    let request: HeartbeatRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::bad_request(format!("invalid heartbeat body: {}", e)))?;

    let node = state.nodes.heartbeat(&hostname, request).await?;
    Ok(Json(json!({
        "hostname": node.hostname,
        "last_heartbeat": node.last_heartbeat,
    })))
}

pub async fn list_nodes(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let nodes: Vec<serde_json::Value> = state
        .nodes
        .list_nodes()
        .await?
        .into_iter()
        .map(|(node, liveness)| {
            json!({
                "hostname": node.hostname,
                "overlay_ip": node.overlay_ip,
                "role": node.role,
                "status": liveness,
                "capabilities": node.capabilities,
                "services_running": node.services_running,
                "last_heartbeat": node.last_heartbeat,
            })
        })
        .collect();
    Ok(Json(json!({ "nodes": nodes })))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (node, liveness) = state.nodes.get_node(&hostname).await?;
    Ok(Json(json!({
        "hostname": node.hostname,
        "overlay_ip": node.overlay_ip,
        "role": node.role,
        "status": liveness,
        "capabilities": node.capabilities,
        "services_running": node.services_running,
        "last_heartbeat": node.last_heartbeat,
        "created_at": node.created_at,
    })))
}

pub async fn remove_node(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.nodes.remove_node(&hostname).await?;
    Ok(Json(json!({ "removed": hostname })))
}

#[derive(Debug, Deserialize)]
pub struct JoinScriptQuery {
    pub token: String,
}

/// Plain-bash bootstrap program; fetched over the overlay domain and
/// piped to bash by joining machines and cloud user-data.
pub async fn join_script(
    State(state): State<AppState>,
    Query(query): Query<JoinScriptQuery>,
) -> Result<String, ApiError> {
    let script = crate::nodes::manager::join_script(
        &state.settings.server.public_url,
        &query.token,
        state.settings.nodes.agent_port,
    );
    Ok(script)
}
