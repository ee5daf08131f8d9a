//! Error types for the relay CLI
//!
//! Messages are user-facing and say what to check next.

use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Error type for CLI operations
#[derive(Error, Debug)]
pub enum CliError {
    /// Staging store operation failed
    #[error("Staging store error: {0}. Check the database path and that no other process owns the store.")]
    Repo(#[from] relay_repo::RepoError),

    /// File system operation failed
    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed
    #[error("Failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check your RELAY_* environment variables.")]
    Config(String),

    /// A destructive command was not confirmed
    #[error("{0}. Re-run with --yes to confirm.")]
    NotConfirmed(String),

    /// Background task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),

    /// Generic anyhow error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a missing confirmation error
    pub fn not_confirmed(msg: impl Into<String>) -> Self {
        Self::NotConfirmed(msg.into())
    }

    /// Create a background task error
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

impl From<tokio::task::JoinError> for CliError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::task(err.to_string())
    }
}
