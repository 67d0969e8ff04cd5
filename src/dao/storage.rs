use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or failed mid-operation.
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A uniqueness constraint rejected the write; the conflicting row already exists.
    #[error("uniqueness constraint `{constraint}` violated")]
    Conflict { constraint: &'static str },
}

/// Constraint guarding the single active session per scheduled event.
pub const ACTIVE_SESSION_CONSTRAINT: &str = "active_session_per_event";
/// Constraint guarding the global uniqueness of session keys.
pub const SESSION_KEY_CONSTRAINT: &str = "session_key";
/// Constraint guarding idempotency keys of live events inside a session.
pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "event_idempotency_key";

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a uniqueness violation for the named constraint.
    pub fn conflict(constraint: &'static str) -> Self {
        StorageError::Conflict { constraint }
    }
}
