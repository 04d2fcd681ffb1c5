//! HTTP request handlers
//!
//! Load and generate stream their events over SSE; the remaining endpoints
//! are plain JSON.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::schema::{AckResponse, AppState, GenerateRequest, HealthResponse, LoadRequest, StatusResponse};
use crate::utils::error::AccelError;

fn sse_event<T: serde::Serialize>(payload: &T) -> Event {
    let json = serde_json::to_string(payload).unwrap_or_else(|e| {
        error!("Failed to serialize SSE event: {}", e);
        "{}".to_string()
    });
    Event::default().data(json)
}

/// Health check handler with engine state
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let shutting_down = state
        .shutdown_flag
        .load(std::sync::atomic::Ordering::Relaxed);

    let status = if shutting_down {
        "shutting_down"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine_state: state.engine.state(),
        model: state.engine.loaded_model(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Server status handler
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running".to_string(),
        engine_state: state.engine.state(),
    })
}

/// Loaded model information
pub async fn model_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.engine.loaded_model() {
        Some(info) => Json(serde_json::json!(info)),
        None => Json(serde_json::json!({ "loaded": false })),
    }
}

/// Load a model, streaming progress over SSE
pub async fn load_model(
    State(state): State<AppState>,
    Json(request): Json<LoadRequest>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, AccelError>
{
    info!("load requested for model {}", request.descriptor.id);

    let events = state.engine.load(request.descriptor).await?;
    let stream = UnboundedReceiverStream::new(events).map(|event| Ok(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Generate text with SSE token streaming
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, AccelError>
{
    let request_id = uuid::Uuid::new_v4();
    info!(
        %request_id,
        "generation requested with {} messages",
        request.messages.len()
    );

    let events = state
        .engine
        .generate(request.messages, request.sampling_params)
        .await?;
    info!(%request_id, "generation started");
    let stream = ReceiverStream::new(events).map(|event| Ok(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Stop the in-flight generation at the next token boundary
pub async fn stop(State(state): State<AppState>) -> Json<AckResponse> {
    state.engine.stop();
    Json(AckResponse { ok: true })
}

/// Unload the current model
pub async fn unload_model(
    State(state): State<AppState>,
) -> std::result::Result<Json<AckResponse>, AccelError> {
    state.engine.unload().await?;
    Ok(Json(AckResponse { ok: true }))
}
