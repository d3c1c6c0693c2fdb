//! Common error types for LLM Ops
//!
//! All errors map to a wire [`ErrorCode`] and an HTTP status so that the
//! transport layer can surface them without inspecting the variant.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llmops_proto::{ErrorCode, FramingError, StreamUnit};
use thiserror::Error;

/// Main error type for LLM Ops
#[derive(Error, Debug)]
pub enum LlmOpsError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed sampling configuration or prompt, rejected before admission
    #[error("Validation error: {0}")]
    Validation(String),

    /// Sampling parameter outside its accepted range
    #[error("Parameter out of range: {0}")]
    ParamOutOfRange(String),

    /// Prompt plus requested tokens exceed the context window
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Worker is shutting down; admission waiters are released with this
    #[error("Worker shutting down")]
    Shutdown,

    /// Failure raised by the inference engine during generation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Request cancelled by the client that issued it
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Request cancelled by the worker itself
    #[error("Request aborted: {0}")]
    Aborted(String),

    /// Caller-supplied deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Controller rejected or could not answer a call
    #[error("Controller error: {0}")]
    Controller(String),

    /// No registered worker serves the requested model
    #[error("No available worker for {0}")]
    NoWorker(String),

    /// Stream framing errors
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for LlmOpsError {
    fn from(err: config::ConfigError) -> Self {
        LlmOpsError::Config(err.to_string())
    }
}

impl LlmOpsError {
    /// Wire error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LlmOpsError::Validation(_) => ErrorCode::ValidationError,
            LlmOpsError::ParamOutOfRange(_) => ErrorCode::ParamOutOfRange,
            LlmOpsError::ContextOverflow(_) => ErrorCode::ContextOverflow,
            LlmOpsError::Shutdown => ErrorCode::Shutdown,
            LlmOpsError::Cancelled(_) => ErrorCode::ClientCancelled,
            LlmOpsError::Aborted(_) => ErrorCode::AbortedByServer,
            LlmOpsError::Timeout(_) => ErrorCode::Timeout,
            LlmOpsError::NoWorker(_) => ErrorCode::ControllerNoWorker,
            _ => ErrorCode::InternalError,
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LlmOpsError::Validation(_)
            | LlmOpsError::ParamOutOfRange(_)
            | LlmOpsError::ContextOverflow(_) => StatusCode::BAD_REQUEST,
            LlmOpsError::Shutdown | LlmOpsError::Aborted(_) | LlmOpsError::NoWorker(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // Non-standard "client closed request"
            LlmOpsError::Cancelled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            LlmOpsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LlmOpsError::Connection(_) | LlmOpsError::Controller(_) | LlmOpsError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a terminal generation unit
    pub fn to_unit(&self) -> StreamUnit {
        StreamUnit::error(self.error_code(), self.to_string())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LlmOpsError::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        LlmOpsError::Validation(msg.into())
    }

    /// Create a parameter range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        LlmOpsError::ParamOutOfRange(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        LlmOpsError::Engine(msg.into())
    }

    /// Create a server-side abort error
    pub fn aborted(msg: impl Into<String>) -> Self {
        LlmOpsError::Aborted(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        LlmOpsError::Timeout(msg.into())
    }

    /// Create a controller error
    pub fn controller(msg: impl Into<String>) -> Self {
        LlmOpsError::Controller(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LlmOpsError::Internal(msg.into())
    }
}

impl IntoResponse for LlmOpsError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_unit())).into_response()
    }
}

/// Result type alias for LLM Ops operations
pub type Result<T> = std::result::Result<T, LlmOpsError>;
