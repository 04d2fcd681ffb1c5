//! Error types for Accel-Engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for Accel-Engine
///
/// Variants map to the failure classes of the load/convert/infer pipeline:
/// malformed sources, unsupported model layouts, storage and device faults,
/// and caller protocol misuse.
#[derive(Error, Debug)]
pub enum AccelError {
    /// Source archive cannot be parsed (oversized header, bad JSON, missing tensors)
    #[error("Malformed source: {0}")]
    SourceMalformed(String),

    /// Model layout the engine cannot handle (unknown dtype code, unknown architecture)
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// Object store read/write failure
    #[error("Storage failure: {0}")]
    Storage(String),

    /// GPU unavailable, lost, or out of resources
    #[error("Device failure: {0}")]
    Device(String),

    /// Operation rejected in the current engine state
    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("No model loaded")]
    ModelNotLoaded,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AccelError {
    /// Short machine-readable kind tag, used by the engine event stream
    pub fn kind(&self) -> &'static str {
        match self {
            AccelError::SourceMalformed(_) => "source_malformed",
            AccelError::Unsupported(_) => "unsupported",
            AccelError::Storage(_) => "storage",
            AccelError::Device(_) => "device",
            AccelError::Busy(_) => "busy",
            AccelError::ModelNotLoaded => "not_loaded",
            AccelError::InvalidParameters(_) => "invalid_parameters",
            AccelError::Timeout => "timeout",
            AccelError::InternalError(_) => "internal",
            AccelError::Io(_) => "io",
        }
    }
}

impl IntoResponse for AccelError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AccelError::SourceMalformed(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AccelError::Unsupported(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AccelError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AccelError::Device(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AccelError::Busy(msg) => (StatusCode::CONFLICT, msg),
            AccelError::ModelNotLoaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No model loaded".to_string(),
            ),
            AccelError::InvalidParameters(msg) => (StatusCode::BAD_REQUEST, msg),
            AccelError::Timeout => (StatusCode::REQUEST_TIMEOUT, "Request timeout".to_string()),
            AccelError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AccelError::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("IO error: {}", err),
            ),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
