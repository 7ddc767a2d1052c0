/// Error types for the FlowK HTTP server.
use thiserror::Error;

use flowk_core::RunnerError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Upload rejected, import escapes upload root: {0}")]
    ImportEscapes(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::ImportEscapes(_) => 400,
            ServerError::Runner(RunnerError::RunInProgress)
            | ServerError::Runner(RunnerError::NoRunInProgress) => 409,
            ServerError::Runner(RunnerError::ResumeTaskNotFound(_))
            | ServerError::Runner(RunnerError::ResumeTaskNotCompleted(_))
            | ServerError::Runner(RunnerError::FilterConflict(_)) => 400,
            ServerError::Runner(RunnerError::Load(_)) => 400,
            ServerError::ConfigError(_) | ServerError::ServerError(_) | ServerError::IoError(_) => {
                500
            }
        }
    }
}
