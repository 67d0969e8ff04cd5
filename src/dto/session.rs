use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dao::models::{NewSession, SessionEntity},
    dto::{format_system_time, validation::validate_client_key},
    services::session_registry::{CompleteOutcome, StartOutcome},
    state::session_machine::SessionPhase,
};

const MAX_CREATED_BY_LENGTH: usize = 128;

/// Payload used to start tracking a scheduled event.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    /// Scheduled event to track.
    pub event_id: i64,
    /// Client-chosen key, reused on retries so a lost response does not start a second session.
    pub session_key: String,
    /// Identity of the user starting the session.
    pub created_by: String,
}

impl Validate for StartSessionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_client_key(&self.session_key) {
            errors.add("session_key", e);
        }

        let created_by = self.created_by.trim();
        if created_by.is_empty() || created_by.len() > MAX_CREATED_BY_LENGTH {
            let mut err = ValidationError::new("created_by_length");
            err.message = Some(
                format!("created_by must be between 1 and {MAX_CREATED_BY_LENGTH} characters")
                    .into(),
            );
            errors.add("created_by", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl From<StartSessionRequest> for NewSession {
    fn from(request: StartSessionRequest) -> Self {
        Self {
            event_id: request.event_id,
            session_key: request.session_key,
            created_by: request.created_by.trim().to_string(),
        }
    }
}

/// Public projection of a tracking session.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: Uuid,
    /// Tracked scheduled event.
    pub event_id: i64,
    /// Game record, once the first event was recorded.
    pub derived_game_id: Option<Uuid>,
    /// Client-chosen key.
    pub session_key: String,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// RFC 3339 start time.
    pub started_at: String,
    /// RFC 3339 completion time.
    pub ended_at: Option<String>,
    /// User who started tracking.
    pub created_by: String,
}

impl From<SessionEntity> for SessionSummary {
    fn from(session: SessionEntity) -> Self {
        Self {
            phase: SessionPhase::of(Some(&session)),
            id: session.id,
            event_id: session.event_id,
            derived_game_id: session.derived_game_id,
            session_key: session.session_key,
            started_at: format_system_time(session.started_at),
            ended_at: session.ended_at.map(format_system_time),
            created_by: session.created_by,
        }
    }
}

/// How a start request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcomeKind {
    /// A new session was created.
    Started,
    /// The key already named this active session.
    Resumed,
    /// Another session already tracks the event.
    AlreadyActive,
}

/// Answer to a start request.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartSessionResponse {
    /// How the request was resolved.
    pub outcome: StartOutcomeKind,
    /// Session the client should attach to.
    pub session: SessionSummary,
}

impl From<StartOutcome> for StartSessionResponse {
    fn from(outcome: StartOutcome) -> Self {
        let (outcome, session) = match outcome {
            StartOutcome::Started(session) => (StartOutcomeKind::Started, session),
            StartOutcome::Resumed(session) => (StartOutcomeKind::Resumed, session),
            StartOutcome::AlreadyActive(session) => (StartOutcomeKind::AlreadyActive, session),
        };
        Self {
            outcome,
            session: session.into(),
        }
    }
}

/// Answer to a completion request.
#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteSessionResponse {
    /// Completed session.
    pub session: SessionSummary,
    /// The session was already completed before this request.
    pub already_completed: bool,
}

impl From<CompleteOutcome> for CompleteSessionResponse {
    fn from(outcome: CompleteOutcome) -> Self {
        Self {
            session: outcome.session.into(),
            already_completed: outcome.already_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_rules() {
        let ok = StartSessionRequest {
            event_id: 16,
            session_key: "tablet-a".into(),
            created_by: "coach".into(),
        };
        assert!(ok.validate().is_ok());

        let bad = StartSessionRequest {
            event_id: 16,
            session_key: "tablet a".into(),
            created_by: "   ".into(),
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("session_key"));
        assert!(fields.contains_key("created_by"));
    }
}
