use axum::routing::{get, post};
use axum::Router;

use crate::auth::handlers;
use crate::state::AppState;

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/auth/setup/status", get(handlers::setup_status))
        .route("/auth/setup", post(handlers::setup))
        .route("/auth/token", post(handlers::exchange_token))
        .route("/auth/refresh", post(handlers::refresh_token))
}

pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(handlers::me))
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/service-token", post(handlers::service_token))
}
