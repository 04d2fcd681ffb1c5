//! API route configuration

use super::handlers::{generate, health, load_model, model_info, status, stop, unload_model};
use super::schema::AppState;
use axum::{
    routing::{get, post},
    Router,
};

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/stop", post(stop))
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/model/info", get(model_info))
        .route("/v1/models/load", post(load_model))
        .route("/v1/models/unload", post(unload_model))
        .with_state(state)
}
