//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The runtime is already removing this container.
    #[error("removal of container {0} already in progress")]
    RemovalInProgress(String),

    /// Image is not present locally and the pull policy forbids pulling.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The container was accepted but its process died during the grace period.
    #[error("worker container {container} exited during startup ({}): {logs}", describe_exit(.exit_code))]
    StartupCrash {
        container: String,
        exit_code: Option<i64>,
        logs: String,
    },

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// The container is already gone or on its way out.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_) | ContainerError::RemovalInProgress(_)
        )
    }
}

fn describe_exit(code: &Option<i64>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "exit code unknown".to_string(),
    }
}
