//! Error types for the service layer.

use thiserror::Error;

use grav_core::CoreError;
use grav_stream::StreamError;
use grav_tools::ToolError;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced to callers of the chat service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(_) => Self::Timeout(err.to_string()),
            CoreError::CheckpointUnavailable(_) => Self::Unavailable(err.to_string()),
            CoreError::Config(_) => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<StreamError> for ServiceError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::InvalidPattern { .. } | StreamError::PatternsDisabled => {
                Self::BadRequest(err.to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<ToolError> for ServiceError {
    fn from(err: ToolError) -> Self {
        Self::Internal(format!("Failed to set up tools: {}", err))
    }
}
