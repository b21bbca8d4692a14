//! Per-node agent daemon.
//!
//! Runs on every u-node: sends heartbeats to the control plane and
//! exposes a small HTTP API the Docker backend drives over the overlay
//! network. The agent keeps no state of its own beyond what the local
//! container runtime records.

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::deployment::backend::remote::{
    AgentDeployRequest, AgentDeployResponse, AgentLogsResponse, AgentStatusResponse,
    NODE_SECRET_HEADER,
};
use crate::deployment::backend::{BackendError, DockerRuntime};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Control plane base URL, e.g. http://leader.tailnet.ts.net:8010
    pub server_url: String,
    pub hostname: String,
    pub node_secret: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
}

#[derive(Clone)]
struct AgentState {
    runtime: DockerRuntime,
    secret: String,
}

/// Agent-side error rendering: logical rejections map to 422 so the
/// leader classifies them as failed, everything else to 503 (retryable).
struct AgentError(BackendError);

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BackendError::Failed(e) => (StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)),
            BackendError::Unavailable(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{:#}", e)),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        Self(err)
    }
}

fn authorize(state: &AgentState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(NODE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.secret {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid node secret" })),
        )
            .into_response());
    }
    Ok(())
}

async fn deploy(
    State(state): State<AgentState>,
    headers: HeaderMap,
    Json(request): Json<AgentDeployRequest>,
) -> Result<Json<AgentDeployResponse>, Response> {
    authorize(&state, &headers)?;

    info!(
        "agent deploy: {} as {}",
        request.definition.image, request.container_name
    );
    state
        .runtime
        .pull_image(&request.definition.image)
        .await
        .map_err(|e| AgentError(e).into_response())?;
    let (container_id, exposed_port) = state
        .runtime
        .run_container(&request.container_name, &request.definition)
        .await
        .map_err(|e| AgentError(e).into_response())?;

    Ok(Json(AgentDeployResponse {
        container_id,
        exposed_port,
    }))
}

async fn status(
    State(state): State<AgentState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<AgentStatusResponse>, Response> {
    authorize(&state, &headers)?;
    let status = state
        .runtime
        .container_state(&name)
        .await
        .map_err(|e| AgentError(e).into_response())?;
    Ok(Json(AgentStatusResponse { name, status }))
}

async fn stop(
    State(state): State<AgentState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    authorize(&state, &headers)?;
    state
        .runtime
        .stop_container(&name)
        .await
        .map_err(|e| AgentError(e).into_response())?;
    Ok(Json(json!({ "stopped": name })))
}

async fn remove(
    State(state): State<AgentState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    authorize(&state, &headers)?;
    state
        .runtime
        .remove_container(&name)
        .await
        .map_err(|e| AgentError(e).into_response())?;
    Ok(Json(json!({ "removed": name })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: i64,
}

fn default_tail() -> i64 {
    100
}

async fn logs(
    State(state): State<AgentState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<AgentLogsResponse>, Response> {
    authorize(&state, &headers)?;
    let logs = state
        .runtime
        .container_logs(&name, query.tail)
        .await
        .map_err(|e| AgentError(e).into_response())?;
    Ok(Json(AgentLogsResponse { logs }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Heartbeat loop: POST the node's status tuple every interval. The
/// leader marks the node stale after three missed beats, so failures are
/// logged and retried on the next tick rather than aborting.
async fn heartbeat_loop(options: AgentOptions, runtime: DockerRuntime) {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/nodes/heartbeat",
        options.server_url.trim_end_matches('/')
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(
        options.heartbeat_interval_secs.max(1),
    ));

    loop {
        ticker.tick().await;

        let services_running = match runtime.running_container_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!("heartbeat: could not list containers: {}", e);
                Vec::new()
            }
        };

        let body = json!({
            "hostname": options.hostname,
            "status": "online",
            "services_running": services_running,
            "capabilities": { "docker": true },
            "metrics": {},
        });

        let result = client
            .post(&url)
            .header(NODE_SECRET_HEADER, &options.node_secret)
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!("heartbeat rejected: {}", response.status());
            }
            Err(e) => {
                warn!("heartbeat failed: {}", e);
            }
        }
    }
}

/// Run the agent: heartbeat task plus the local deploy API.
pub async fn run(options: AgentOptions) -> Result<()> {
    let runtime = DockerRuntime::connect()?;

    let heartbeat_options = options.clone();
    let heartbeat_runtime = runtime.clone();
    tokio::spawn(async move {
        heartbeat_loop(heartbeat_options, heartbeat_runtime).await;
    });

    let state = AgentState {
        runtime,
        secret: options.node_secret.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/deploy", post(deploy))
        .route("/api/status/{name}", get(status))
        .route("/api/stop/{name}", post(stop))
        .route("/api/remove/{name}", delete(remove))
        .route("/api/logs/{name}", get(logs))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", options.port);
    info!("node agent listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .await
        .context("agent server error")?;

    error!("agent server exited");
    Ok(())
}
