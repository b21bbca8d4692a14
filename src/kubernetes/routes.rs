use axum::routing::{delete, post};
use axum::Router;

use crate::kubernetes::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/kubernetes/clusters",
            post(handlers::register_cluster).get(handlers::list_clusters),
        )
        .route("/kubernetes/clusters/{id}", delete(handlers::remove_cluster))
}
