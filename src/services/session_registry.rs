use std::time::SystemTime;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{NewSession, SessionEntity},
        storage::{ACTIVE_SESSION_CONSTRAINT, SESSION_KEY_CONSTRAINT},
    },
    error::ServiceError,
    services::{goal_progress, sse_events},
    state::{
        SharedState,
        session_machine::{self, SessionAction, SessionPhase},
    },
};

/// Rounds of check-then-insert before a start race is reported as unresolved.
const START_ATTEMPTS: usize = 3;

/// Outcome of a start-tracking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was created.
    Started(SessionEntity),
    /// The session key already names this active session.
    Resumed(SessionEntity),
    /// Another session is active for the event; callers may attach to it.
    AlreadyActive(SessionEntity),
}

impl StartOutcome {
    /// Session the start resolved to.
    pub fn session(&self) -> &SessionEntity {
        match self {
            StartOutcome::Started(session)
            | StartOutcome::Resumed(session)
            | StartOutcome::AlreadyActive(session) => session,
        }
    }

    /// Take the session the start resolved to.
    pub fn into_session(self) -> SessionEntity {
        match self {
            StartOutcome::Started(session)
            | StartOutcome::Resumed(session)
            | StartOutcome::AlreadyActive(session) => session,
        }
    }
}

/// Outcome of a complete-tracking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteOutcome {
    /// Session after the call.
    pub session: SessionEntity,
    /// The session was already completed.
    pub already_completed: bool,
}

/// Start tracking `request.event_id`, or report the session that already tracks it.
///
/// The store's uniqueness constraints are the authority: a lost insert race is
/// resolved by re-reading the winner instead of failing.
pub async fn start_session(
    state: &SharedState,
    request: NewSession,
) -> Result<StartOutcome, ServiceError> {
    let store = state.require_store().await?;

    for attempt in 0..START_ATTEMPTS {
        let by_key = state
            .store_call(store.find_session_by_key(request.session_key.clone()))
            .await?;
        if let Some(existing) = by_key {
            if existing.event_id != request.event_id {
                return Err(ServiceError::InvalidInput(format!(
                    "session key `{}` belongs to event {}",
                    request.session_key, existing.event_id
                )));
            }
            session_machine::plan(SessionPhase::of(Some(&existing)), SessionAction::Start)?;
            return Ok(StartOutcome::Resumed(existing));
        }

        let active = state
            .store_call(store.find_active_session_by_event(request.event_id))
            .await?;
        if let Some(existing) = active {
            return Ok(StartOutcome::AlreadyActive(existing));
        }

        session_machine::plan(SessionPhase::None, SessionAction::Start)?;
        match state.store_call(store.create_session(request.clone())).await {
            Ok(session) => {
                info!(
                    session_id = %session.id,
                    event_id = session.event_id,
                    created_by = %session.created_by,
                    "session started"
                );
                sse_events::broadcast_session_started(state, &session);
                return Ok(StartOutcome::Started(session));
            }
            Err(ServiceError::StoreConflict { constraint })
                if constraint == ACTIVE_SESSION_CONSTRAINT
                    || constraint == SESSION_KEY_CONSTRAINT =>
            {
                warn!(
                    event_id = request.event_id,
                    attempt, constraint, "lost session start race; re-reading winner"
                );
            }
            Err(err) => return Err(err),
        }
    }

    Err(ServiceError::DuplicateSessionConflict {
        event_id: request.event_id,
    })
}

/// Complete an active session. Completing a completed session is an idempotent success.
///
/// The transition commits only once the store acknowledges it; goal progress is
/// then recomputed in the background.
pub async fn complete_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<CompleteOutcome, ServiceError> {
    let _gate = state.session_gates().exclusive(&session_id).await;
    let session = get_session(state, session_id).await?;
    let plan = session_machine::plan(SessionPhase::of(Some(&session)), SessionAction::Complete)?;
    if plan.is_noop() {
        return Ok(CompleteOutcome {
            session,
            already_completed: true,
        });
    }

    let store = state.require_store().await?;
    let completed = state
        .store_call(store.complete_session(session_id, SystemTime::now()))
        .await?
        .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;

    info!(%session_id, event_id = completed.event_id, "session completed");
    sse_events::broadcast_session_completed(state, &completed);
    goal_progress::spawn_recompute(state.clone(), session_id);

    Ok(CompleteOutcome {
        session: completed,
        already_completed: false,
    })
}

/// Session by id.
pub async fn get_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionEntity, ServiceError> {
    let store = state.require_store().await?;
    state
        .store_call(store.find_session(session_id))
        .await?
        .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))
}

/// Session by its client key.
pub async fn find_session_by_key(
    state: &SharedState,
    session_key: &str,
) -> Result<Option<SessionEntity>, ServiceError> {
    let store = state.require_store().await?;
    state
        .store_call(store.find_session_by_key(session_key.to_string()))
        .await
}

/// Active session of a scheduled event.
pub async fn active_session_for_event(
    state: &SharedState,
    event_id: i64,
) -> Result<Option<SessionEntity>, ServiceError> {
    let store = state.require_store().await?;
    state
        .store_call(store.find_active_session_by_event(event_id))
        .await
}

/// Populate `derived_game_id` exactly once and return it.
///
/// Concurrent callers race on a compare-and-set at the store; every caller gets the winner's id.
pub async fn ensure_game_record(
    state: &SharedState,
    session: &SessionEntity,
) -> Result<Uuid, ServiceError> {
    if let Some(game_id) = session.derived_game_id {
        return Ok(game_id);
    }

    let store = state.require_store().await?;
    let candidate = Uuid::new_v4();
    let updated = state
        .store_call(store.attach_game(session.id, candidate))
        .await?
        .ok_or_else(|| ServiceError::SessionNotFound(session.id.to_string()))?;

    match updated.derived_game_id {
        Some(game_id) => {
            if game_id == candidate {
                info!(session_id = %session.id, %game_id, "derived game record created");
            }
            Ok(game_id)
        }
        None => Err(ServiceError::SessionNotFound(session.id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{config::AppConfig, dao::tracking_store::MemoryTrackingStore, state::AppState};

    async fn state() -> SharedState {
        let state = AppState::new(AppConfig::default());
        state.set_store(Arc::new(MemoryTrackingStore::new())).await;
        state
    }

    fn request(key: &str) -> NewSession {
        NewSession {
            event_id: 16,
            session_key: key.into(),
            created_by: "coach".into(),
        }
    }

    #[tokio::test]
    async fn second_start_reports_the_active_session() {
        let state = state().await;
        let first = start_session(&state, request("tablet-a")).await.unwrap();
        let second = start_session(&state, request("tablet-b")).await.unwrap();

        assert!(matches!(first, StartOutcome::Started(_)));
        match second {
            StartOutcome::AlreadyActive(existing) => assert_eq!(existing.id, first.session().id),
            other => panic!("expected AlreadyActive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_key_resumes() {
        let state = state().await;
        let first = start_session(&state, request("tablet-a")).await.unwrap();
        let again = start_session(&state, request("tablet-a")).await.unwrap();
        assert_eq!(again, StartOutcome::Resumed(first.into_session()));
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_session() {
        let state = state().await;
        let handles = (0..8)
            .map(|n| {
                let state = state.clone();
                tokio::spawn(async move {
                    start_session(&state, request(&format!("device-{n}")))
                        .await
                        .map(StartOutcome::into_session)
                })
            })
            .collect::<Vec<_>>();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn completed_key_cannot_be_reused() {
        let state = state().await;
        let started = start_session(&state, request("tablet-a")).await.unwrap();
        let id = started.session().id;

        let done = complete_session(&state, id).await.unwrap();
        assert!(!done.already_completed);
        assert!(!done.session.is_active);

        let again = complete_session(&state, id).await.unwrap();
        assert!(again.already_completed);

        let err = start_session(&state, request("tablet-a")).await.unwrap_err();
        assert!(matches!(err, ServiceError::SessionNotActive(_)));

        let fresh = start_session(&state, request("tablet-b")).await.unwrap();
        assert!(matches!(fresh, StartOutcome::Started(_)));
    }

    #[tokio::test]
    async fn unknown_session_cannot_complete() {
        let state = state().await;
        let err = complete_session(&state, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn game_record_is_created_once() {
        let state = state().await;
        let session = start_session(&state, request("tablet-a"))
            .await
            .unwrap()
            .into_session();

        let first = ensure_game_record(&state, &session).await.unwrap();
        let second = ensure_game_record(&state, &session).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            get_session(&state, session.id).await.unwrap().derived_game_id,
            Some(first)
        );
    }

    #[tokio::test]
    async fn degraded_state_rejects_calls() {
        let state = AppState::new(AppConfig::default());
        let err = start_session(&state, request("tablet-a")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }
}
