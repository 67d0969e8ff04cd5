use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::dao::models::SessionEntity;

/// Lifecycle phases of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session exists yet for the requested key.
    None,
    /// The session accepts events.
    Active,
    /// Tracking ended; terminal.
    Completed,
}

impl SessionPhase {
    /// Phase of an optional stored session row.
    pub fn of(session: Option<&SessionEntity>) -> Self {
        match session {
            None => SessionPhase::None,
            Some(session) if session.is_active => SessionPhase::Active,
            Some(_) => SessionPhase::Completed,
        }
    }
}

/// Actions that can be applied to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Start tracking, or resume an already active session.
    Start,
    /// End tracking.
    Complete,
    /// Append or retract an event.
    Record,
}

/// Error returned when an action is not allowed from the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {action:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// Phase the session was in.
    pub from: SessionPhase,
    /// Rejected action.
    pub action: SessionAction,
}

/// Validated transition that the caller commits against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Phase before the action.
    pub from: SessionPhase,
    /// Phase after the action.
    pub to: SessionPhase,
    /// Action that was planned.
    pub action: SessionAction,
}

impl Plan {
    /// Whether applying the plan leaves the phase unchanged.
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Compute the transition for `action` from `from`.
pub fn plan(from: SessionPhase, action: SessionAction) -> Result<Plan, InvalidTransition> {
    let to = match (from, action) {
        (SessionPhase::None, SessionAction::Start) => SessionPhase::Active,
        (SessionPhase::Active, SessionAction::Start) => SessionPhase::Active,
        (SessionPhase::Active, SessionAction::Complete) => SessionPhase::Completed,
        (SessionPhase::Active, SessionAction::Record) => SessionPhase::Active,
        (SessionPhase::Completed, SessionAction::Complete) => SessionPhase::Completed,
        (from, action) => return Err(InvalidTransition { from, action }),
    };

    Ok(Plan { from, to, action })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_activates_a_new_session() {
        let plan = plan(SessionPhase::None, SessionAction::Start).unwrap();
        assert_eq!(plan.to, SessionPhase::Active);
        assert!(!plan.is_noop());
    }

    #[test]
    fn start_on_active_session_resumes_it() {
        let plan = plan(SessionPhase::Active, SessionAction::Start).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn completion_is_one_way_and_idempotent() {
        let first = plan(SessionPhase::Active, SessionAction::Complete).unwrap();
        assert_eq!(first.to, SessionPhase::Completed);

        let again = plan(SessionPhase::Completed, SessionAction::Complete).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn only_active_sessions_accept_events() {
        assert!(plan(SessionPhase::Active, SessionAction::Record).is_ok());

        for from in [SessionPhase::None, SessionPhase::Completed] {
            let err = plan(from, SessionAction::Record).unwrap_err();
            assert_eq!(err.from, from);
            assert_eq!(err.action, SessionAction::Record);
        }
    }

    #[test]
    fn completed_sessions_cannot_restart() {
        let err = plan(SessionPhase::Completed, SessionAction::Start).unwrap_err();
        assert_eq!(err.from, SessionPhase::Completed);
    }

    #[test]
    fn unknown_sessions_cannot_complete() {
        assert!(plan(SessionPhase::None, SessionAction::Complete).is_err());
    }
}
