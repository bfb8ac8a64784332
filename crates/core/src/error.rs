//! Error types for the RLM domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use std::time::Duration;
use thiserror::Error;

/// The top-level error type for all RLM operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model client errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Wire protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Request router errors ---
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    // --- Execution environment errors ---
    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Sub-agent call failed: {0}")]
    SubAgent(String),
}

/// Failures of the length-prefixed wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before message complete")]
    ConnectionClosed,

    #[error("Connection closed without a response")]
    NoResponse,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Construction-time failures of an execution environment.
///
/// Failures of the executed code itself are never errors; they are carried
/// as `stderr` in the [`ExecutionResult`](crate::environment::ExecutionResult).
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Unknown environment kind: {0}")]
    UnknownKind(String),

    #[error("Environment not configured: {0}")]
    NotConfigured(String),

    #[error("Environment setup failed: {0}")]
    Setup(String),
}
