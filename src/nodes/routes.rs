use axum::routing::{get, post};
use axum::Router;

use crate::nodes::handlers;
use crate::state::AppState;

/// Routes reachable without a user token: node registration and
/// heartbeats authenticate with their own headers.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/nodes/join", post(handlers::join))
        .route("/nodes/heartbeat", post(handlers::heartbeat))
        .route("/nodes/join-script", get(handlers::join_script))
}

pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/join-tokens", post(handlers::create_join_token))
        .route(
            "/nodes/{hostname}",
            get(handlers::get_node).delete(handlers::remove_node),
        )
}
