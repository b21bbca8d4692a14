use axum::routing::{get, post, put};
use axum::Router;

use crate::github_import::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/github-import/scan", post(handlers::scan))
        .route("/github-import/parse", post(handlers::parse))
        .route("/github-import/register", post(handlers::register))
        .route("/github-import/imported", get(handlers::imported))
        .route(
            "/github-import/imported/{id}/config",
            put(handlers::update_config),
        )
        .route(
            "/github-import/imported/{id}",
            axum::routing::delete(handlers::delete),
        )
}
