//! Error types for the core module.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while running a conversation turn.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Model returned empty response")]
    EmptyResponse,

    #[error("Tool execution failed: {tool} - {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Workflow timed out after {0} seconds")]
    Timeout(u64),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Checkpoint store unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("Invalid workflow state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Classification reported in terminal `error` events.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            _ => "execution_error",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
