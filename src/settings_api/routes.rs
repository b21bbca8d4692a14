use axum::routing::{get, post};
use axum::Router;

use crate::settings_api::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/settings/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        .route(
            "/settings/requirements",
            get(handlers::get_requirements).post(handlers::save_requirements),
        )
        .route("/settings/refresh", post(handlers::refresh))
        .route("/settings/reset", post(handlers::reset))
}
