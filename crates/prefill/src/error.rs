//! Caller-facing error taxonomy for session operations.

use thiserror::Error;

use crate::container::ContainerError;
use crate::crypto::CodecError;

/// Result type for session operations.
pub type PrefillResult<T> = Result<T, PrefillError>;

/// Errors surfaced by [`crate::session::SessionRegistry`].
#[derive(Debug, Error)]
pub enum PrefillError {
    /// No session with this id is registered.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but is no longer `Active`.
    #[error("session {0} is not active")]
    SessionNotActive(String),

    /// The operation needs a logged-in worker.
    #[error("session {0} is not logged in")]
    NotAuthenticated(String),

    /// The principal is banned. Not transient; callers must not retry.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The challenge id does not match the pending challenge.
    #[error("no pending challenge with id {0}")]
    ChallengeNotFound(String),

    /// The worker did not answer before the deadline, or the wait was cancelled.
    #[error("no response from worker for {command}")]
    NoResponse { command: String },

    /// The worker answered with `success = false`.
    #[error("worker rejected {command}: {message}")]
    CommandFailed { command: String, message: String },

    /// Container infrastructure failure, including crash-on-start.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Credential encryption failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The worker wrote something we could not interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Persistence or I/O failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PrefillError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PrefillError::NoResponse { .. })
    }
}
