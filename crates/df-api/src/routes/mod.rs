pub mod backups;
pub mod instances;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router, middleware};

use crate::auth::auth_middleware;
use crate::dto::HealthResponse;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Instances
        .route(
            "/instances",
            post(instances::create_instance).get(instances::list_instances),
        )
        .route(
            "/instances/{id}",
            get(instances::get_instance).delete(instances::delete_instance),
        )
        .route("/instances/{id}/status", put(instances::change_status))
        // Backups
        .route(
            "/backups",
            post(backups::create_backup).get(backups::list_backups),
        )
        .route(
            "/backups/{id}",
            get(backups::get_backup).delete(backups::delete_backup),
        )
        .route("/backups/{id}/restore", post(backups::restore_backup))
        // Compensation journal
        .route("/leaked-resources", get(backups::list_leaked_resources))
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        demo: state.coordinator.is_demo(),
        in_flight: state.coordinator.reconciler().in_flight(),
    })
}
