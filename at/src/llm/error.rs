//! Gateway error types

use std::time::Duration;
use thiserror::Error;

/// Errors from the inference service client
#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("circuit open, gateway halted")]
    CircuitOpen,

    #[error("task deadline elapsed before dispatch")]
    DeadlineElapsed,

    #[error("gateway shutting down")]
    Shutdown,
}

impl LlmError {
    /// Only connection errors are retried at the request level
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
