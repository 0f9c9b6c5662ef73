//! Error types for local server operations.

use thiserror::Error;

/// Errors that can occur while supervising llama-server or talking to it.
#[derive(Debug, Error)]
pub enum LocalAIError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Model file not found.
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    /// llama-server binary not found in any candidate location.
    #[error("llama-server binary not found (searched: {0})")]
    ServerBinaryNotFound(String),

    /// The configured port is already bound by another process.
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// The model is unlikely to fit in memory.
    #[error("Insufficient memory: model needs about {required} bytes, host has {available}")]
    InsufficientMemory { required: u64, available: u64 },

    /// Creating the server process failed.
    #[error("Failed to spawn llama-server: {0}")]
    SpawnFailed(String),

    /// The server did not become ready before the deadline.
    #[error("Timeout waiting for server to become ready (last error: {last_error})")]
    StartupTimeout { last_error: String },

    /// The server process exited while it was expected to be running.
    #[error("Server process terminated unexpectedly: {0}")]
    ProcessTerminatedUnexpectedly(String),

    /// A load is already running; concurrent loads are rejected.
    #[error("A server start is already in progress")]
    StartInProgress,

    /// The operation was cancelled because the server is being stopped.
    #[error("Operation cancelled")]
    Cancelled,

    /// A request was issued while the server is not ready.
    #[error("Server is not ready (state: {0})")]
    NotReady(String),

    /// The request could not be sent or the connection broke.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The server answered with a non-success status.
    #[error("Server returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The server answered with something that could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The stream ended without any data events.
    #[error("Server returned no data")]
    NoData,
}

impl LocalAIError {
    /// Precondition failures are fatal to the current attempt and never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            LocalAIError::ModelNotFound(_)
                | LocalAIError::ServerBinaryNotFound(_)
                | LocalAIError::PortInUse(_)
                | LocalAIError::InsufficientMemory { .. }
        )
    }

    /// Map a reqwest failure that happened before a response arrived.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            LocalAIError::RequestFailed(err.to_string())
        } else {
            LocalAIError::Http(err)
        }
    }
}
