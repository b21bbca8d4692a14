use axum::http::HeaderValue;
use axum::{middleware, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth;
use crate::cloud;
use crate::deployment;
use crate::github_import;
use crate::kubernetes;
use crate::nodes;
use crate::settings::Settings;
use crate::settings_api;
use crate::state::{AppState, StartupError};

/// Run the control plane: build state, reconcile the proxy against the
/// authoritative deployment set, then serve the HTTP API until a
/// shutdown signal arrives.
pub async fn run_server(settings: Settings) -> Result<(), StartupError> {
    let state = AppState::new(settings).await?;

    // Startup reconciliation: replay the full desired route set and prune
    // routes the engine does not recognise.
    match state.engine.desired_routes().await {
        Ok(desired) => state.proxy.reconcile(desired).await,
        Err(e) => warn!("proxy reconciliation skipped: {}", e.message),
    }

    // Periodic hygiene for spent join tokens.
    {
        let nodes = state.nodes.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) = nodes.purge_expired_tokens().await {
                    warn!("join token purge failed: {}", e.message);
                }
            }
        });
    }

    let public_routes = Router::new()
        .route("/health", axum::routing::get(health_check))
        .route("/version", axum::routing::get(version_info))
        .merge(auth::routes::public_routes())
        .merge(nodes::routes::public_routes());

    let protected_routes = Router::new()
        .merge(auth::routes::protected_routes())
        .merge(nodes::routes::protected_routes())
        .merge(deployment::routes::deployment_routes())
        .merge(deployment::routes::service_routes())
        .merge(settings_api::routes::routes())
        .merge(cloud::routes::routes())
        .merge(github_import::routes::routes())
        .merge(kubernetes::routes::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::middleware::auth_middleware,
        ));

    let api_routes = public_routes.merge(protected_routes);

    let mut cors = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);
    for origin in &state.settings.server.cors_origins {
        if let Ok(value) = origin.parse::<HeaderValue>() {
            cors = cors.allow_origin(value);
        }
    }

    let app = Router::new()
        .nest("/api", api_routes)
        .with_state(state.clone())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors));

    let addr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    info!("HTTP server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::Internal(anyhow::Error::new(e).context("Failed to bind")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Internal(anyhow::Error::new(e).context("Server error")))?;

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "repository": env!("CARGO_PKG_REPOSITORY"),
    }))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
