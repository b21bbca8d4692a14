use axum::routing::{get, post};
use axum::Router;

use crate::deployment::handlers;
use crate::state::AppState;

pub fn deployment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/deployments",
            post(handlers::create_deployment).get(handlers::list_deployments),
        )
        .route("/deployments/deploy-all", post(handlers::deploy_all))
        .route("/deployments/states", get(handlers::deployment_states))
        .route(
            "/deployments/{id}",
            get(handlers::get_deployment).delete(handlers::delete_deployment),
        )
        .route("/deployments/{id}/status", get(handlers::refresh_status))
        .route("/deployments/{id}/stop", post(handlers::stop_deployment))
        .route("/deployments/{id}/logs", get(handlers::deployment_logs))
}

pub fn service_routes() -> Router<AppState> {
    Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/{id}/start", post(handlers::start_service))
        .route("/services/{id}/stop", post(handlers::stop_service))
        .route("/services/{id}/restart", post(handlers::restart_service))
        .route("/services/{id}/preflight", get(handlers::preflight))
}
