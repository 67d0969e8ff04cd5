use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

/// Convenient result alias returning [`MongoDaoError`] failures.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// MongoDB server code reported for unique index violations.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Failures raised by the MongoDB backend.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// Required environment variable is not set.
    #[error("missing MongoDB environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Connection URI could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    /// Client options were rejected.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    /// No ping succeeded while connecting.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    /// Periodic ping failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    /// Index creation failed at start-up.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    /// A unique index rejected the write.
    #[error("unique index `{constraint}` rejected the write")]
    Duplicate { constraint: &'static str },
    /// Session write failed.
    #[error("failed to save session `{id}`")]
    SaveSession {
        id: String,
        #[source]
        source: MongoError,
    },
    /// Session read failed.
    #[error("failed to load session `{id}`")]
    LoadSession {
        id: String,
        #[source]
        source: MongoError,
    },
    /// Session listing failed.
    #[error("failed to list sessions")]
    ListSessions {
        #[source]
        source: MongoError,
    },
    /// Event write failed.
    #[error("failed to save event for session `{session_id}`")]
    SaveEvent {
        session_id: String,
        #[source]
        source: MongoError,
    },
    /// Event read failed.
    #[error("failed to load events for session `{session_id}`")]
    LoadEvents {
        session_id: String,
        #[source]
        source: MongoError,
    },
    /// Stored document could not be decoded.
    #[error("stored document `{id}` is malformed: {reason}")]
    InvalidDocument { id: String, reason: String },
}

/// Return the name of the unique index a write collided with, if the error is a duplicate key.
pub fn duplicate_index(err: &MongoError) -> Option<&str> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE =>
        {
            Some(write_error.message.as_str())
        }
        _ => None,
    }
}
