//! Error types for the staging store

use thiserror::Error;

/// Result type alias for store operations
pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// Errors raised by the staging store
///
/// Forwarding failures are not errors of the store: they are recorded as
/// state on the forward record and never surface here.
#[derive(Error, Debug)]
pub enum RepoError {
    /// SQLite statement or connection failure
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File system failure while opening the store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A transaction was started while this thread already holds one
    #[error("Nested transaction: this thread is already inside a store transaction")]
    NestedTransaction,

    /// The caller passed something the store cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The persisted state contradicts itself; the store must not continue
    #[error("Store invariant violated: {0}")]
    Invariant(String),

    /// Requested record does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RepoError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a not found error
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error signals lock contention on the database file
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Whether this error must stop the process rather than be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_detection() {
        let busy = RepoError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());
        assert!(!busy.is_fatal());

        let other = RepoError::invalid_argument("destination name is empty");
        assert!(!other.is_busy());
    }

    #[test]
    fn test_invariant_is_fatal() {
        let err = RepoError::invariant("source table not empty after clear");
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Store invariant violated: source table not empty after clear"
        );
    }
}
