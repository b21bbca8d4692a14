use axum::routing::{delete, get, post};
use axum::Router;

use crate::cloud::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cloud/credentials", post(handlers::save_credentials))
        .route(
            "/cloud/credentials/{provider}",
            delete(handlers::remove_credentials),
        )
        .route("/cloud/providers", get(handlers::list_providers))
        .route(
            "/cloud/providers/{provider}/regions",
            get(handlers::list_regions),
        )
        .route(
            "/cloud/providers/{provider}/sizes",
            get(handlers::list_sizes),
        )
        .route(
            "/cloud/providers/{provider}/recommended-size",
            get(handlers::recommended_size),
        )
        .route("/cloud/provision", post(handlers::provision))
        .route("/cloud/instances", get(handlers::list_instances))
        .route("/cloud/instances/{id}", get(handlers::get_instance))
        .route(
            "/cloud/instances/{id}/start",
            post(handlers::start_instance),
        )
        .route("/cloud/instances/{id}/stop", post(handlers::stop_instance))
        .route(
            "/cloud/instances/{id}/reboot",
            post(handlers::reboot_instance),
        )
        .route(
            "/cloud/instances/{id}/terminate",
            delete(handlers::terminate_instance),
        )
        .route("/cloud/usage", get(handlers::usage_summary))
        .route("/cloud/estimate", get(handlers::estimate_cost))
}
