//! Typed error hierarchy for the sandbox subsystem.
//!
//! `SandboxError` is what the lifecycle manager and the HTTP layer surface to
//! callers. Recovery procedures and the concrete collaborators use
//! `anyhow::Result` internally and are converted at the boundary.

use thiserror::Error;

/// Errors surfaced by the sandbox lifecycle API.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Missing or invalid configuration. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No sandbox found for session {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Sandbox for session {session_id} is {status}; recovery is required before use")]
    SandboxUnhealthy { session_id: String, status: String },

    #[error("Failed to create sandbox for session {session_id}: {message}")]
    CreationFailed { session_id: String, message: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Sandbox provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("Session store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandboxError {
    /// Whether a caller may reasonably retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout { .. } | SandboxError::Provider(_) | SandboxError::Store(_)
        )
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
