//! Error types for sandbox operations.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// OS-level isolation is not available on this system.
    #[error("Sandbox unavailable: {message}\n\n{install_hint}")]
    Unavailable {
        message: String,
        install_hint: String,
    },

    /// Active-sandbox ceiling reached; callers should back off and retry.
    #[error("Sandbox capacity exceeded: {active} active, maximum {max}")]
    CapacityExceeded { active: usize, max: usize },

    /// No active sandbox with this id.
    #[error("Sandbox not found: {0}")]
    NotFound(String),

    /// Failed to spawn or monitor the isolated process.
    #[error("Failed to spawn sandboxed process: {0}")]
    SpawnFailed(String),

    /// Failed to materialize or parse a payload/result document.
    #[error("Payload error: {0}")]
    Payload(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
