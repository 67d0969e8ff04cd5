use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dao::storage::StorageError, services::offline_queue::QueueError,
    state::session_machine::InvalidTransition,
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No session matches the given id or key.
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// The session exists but does not allow the operation in its current phase.
    #[error("session not active: {0}")]
    SessionNotActive(String),
    /// Own-team event referencing a player missing from the roster.
    #[error("player not found: {0}")]
    PlayerNotFound(i64),
    /// No event with this id in the session.
    #[error("event not found: {0}")]
    EventNotFound(Uuid),
    /// A start-session race that could not be resolved to the winning session.
    #[error("event {event_id} already has an active session")]
    DuplicateSessionConflict { event_id: i64 },
    /// One queued event failed to replay.
    #[error("replay of `{key}` failed: {reason}")]
    SyncReplayFailure { key: String, reason: String },
    /// A store uniqueness constraint rejected a write.
    #[error("store constraint `{constraint}` rejected the write")]
    StoreConflict { constraint: &'static str },
    /// The offline queue could not be read or written.
    #[error("offline queue unavailable")]
    Queue(#[from] QueueError),
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Application is running in degraded mode without storage.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

impl ServiceError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable(_)
                | ServiceError::Queue(_)
                | ServiceError::Degraded
                | ServiceError::Timeout
        )
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { constraint } => ServiceError::StoreConflict { constraint },
            other => ServiceError::Unavailable(other),
        }
    }
}

impl From<InvalidTransition> for ServiceError {
    fn from(err: InvalidTransition) -> Self {
        ServiceError::SessionNotActive(err.to_string())
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::SessionNotFound(_) | ServiceError::EventNotFound(_) => {
                AppError::NotFound(message)
            }
            ServiceError::SessionNotActive(_)
            | ServiceError::DuplicateSessionConflict { .. }
            | ServiceError::StoreConflict { .. } => AppError::Conflict(message),
            ServiceError::PlayerNotFound(_)
            | ServiceError::InvalidInput(_)
            | ServiceError::SyncReplayFailure { .. } => AppError::BadRequest(message),
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Queue(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Degraded => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::storage::IDEMPOTENCY_KEY_CONSTRAINT;

    #[test]
    fn storage_conflicts_stay_distinguishable() {
        let err = ServiceError::from(StorageError::conflict(IDEMPOTENCY_KEY_CONSTRAINT));
        assert!(matches!(
            err,
            ServiceError::StoreConflict {
                constraint: IDEMPOTENCY_KEY_CONSTRAINT
            }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn store_failures_map_to_service_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = ServiceError::from(StorageError::unavailable("slow".into(), io));
        assert!(err.is_transient());

        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_failures_are_client_errors() {
        let response = AppError::from(ServiceError::PlayerNotFound(99)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            AppError::from(ServiceError::SessionNotActive("done".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
