//! Events streamed from the engine to callers

use serde::{Deserialize, Serialize};

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Empty,
    Loading,
    Ready,
    Generating,
    Unloading,
}

/// Load phases, in order of appearance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    Cache,
    Download,
    Convert,
    Gpu,
    Done,
}

/// Progress report during a model load
#[derive(Debug, Clone, Serialize)]
pub struct LoadProgress {
    /// Monotone 0-100 across all phases
    pub percent: f32,
    pub phase: LoadPhase,
    pub message: String,
}

/// Stream of load events; an error ends the stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadEvent {
    Progress(LoadProgress),
    Error { kind: String, message: String },
}

/// Stream of generation events; Done or Error ends the stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Token {
        text: String,
        id: u32,
    },
    Done {
        tokens_per_second: f64,
        token_count: usize,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// End-of-stream statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerationSummary {
    pub tokens_per_second: f64,
    pub token_count: usize,
}
