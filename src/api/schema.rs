//! API request/response schemas

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::inference::templates::ChatMessage;
use crate::inference::SamplingParams;
use crate::model::ModelDescriptor;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,

    /// Shutdown flag for graceful shutdown coordination
    pub shutdown_flag: std::sync::Arc<std::sync::atomic::AtomicBool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

/// Request to load a model
#[derive(Debug, Deserialize, Serialize)]
pub struct LoadRequest {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
}

/// Request to generate a reply to a message history
#[derive(Debug, Deserialize, Serialize)]
pub struct GenerateRequest {
    /// Ordered chat history (system/user/assistant)
    pub messages: Vec<ChatMessage>,

    /// Sampling parameters (optional, uses defaults if not provided)
    #[serde(default)]
    pub sampling_params: SamplingParams,
}

/// Health check response with detailed status
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub engine_state: crate::engine::events::EngineState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<crate::engine::LoadedModelInfo>,

    pub uptime_seconds: u64,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub engine_state: crate::engine::events::EngineState,
}

/// Simple acknowledgement body
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}
