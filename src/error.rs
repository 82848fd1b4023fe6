//! Error types for the voice-agent core.

use crate::functions::FunctionError;

/// Top-level error type for the orchestrator and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error (missing key, invalid value, unreadable file).
    #[error("config error: {0}")]
    Config(String),

    /// Credential resolution error (missing or empty API key).
    #[error("credential error: {0}")]
    Credentials(String),

    /// Audio source/sink error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Streaming transport error (connect, send, close).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected server event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// REST chain stage error after retries are exhausted.
    #[error("backend error: {0}")]
    Backend(String),

    /// Function execution error (policy, validation, or host failure).
    #[error("function error: {0}")]
    Function(#[from] FunctionError),

    /// Session state machine violation.
    #[error("state error: {0}")]
    State(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
