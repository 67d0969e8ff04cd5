use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    dao::models::SessionEntity,
    dto::sse::{ScoreUpdateEvent, ServerEvent, SessionLifecycleEvent, SystemStatus},
    services::aggregator::aggregate,
    state::{AppState, SharedState, SseHub, session_machine::SessionPhase},
};

const EVENT_SCORE_UPDATED: &str = "score.updated";
const EVENT_SESSION_STARTED: &str = "session.started";
const EVENT_SESSION_COMPLETED: &str = "session.completed";
const EVENT_SYSTEM_STATUS: &str = "system.status";
pub(crate) const EVENT_GOAL_STATUS_CHANGED: &str = "goal.status_changed";

/// Broadcast that the backend entered or left degraded mode.
pub fn broadcast_system_status(state: &AppState, degraded: bool) {
    send_live_event(state.live_sse(), EVENT_SYSTEM_STATUS, &SystemStatus { degraded });
}

/// Broadcast that a session started.
pub fn broadcast_session_started(state: &AppState, session: &SessionEntity) {
    send_live_event(
        state.live_sse(),
        EVENT_SESSION_STARTED,
        &SessionLifecycleEvent::from(session),
    );
}

/// Broadcast that a session completed.
pub fn broadcast_session_completed(state: &AppState, session: &SessionEntity) {
    state.score_revisions().forget(session.id);
    send_live_event(
        state.live_sse(),
        EVENT_SESSION_COMPLETED,
        &SessionLifecycleEvent::from(session),
    );
}

/// Recompute the score of `session_id` in the background and broadcast it.
///
/// Best effort: failures are logged and never reach the recording request.
/// Call it after the write landed; snapshots overtaken by a newer one are dropped.
pub fn spawn_score_update(state: SharedState, session_id: Uuid) {
    let revision = state.score_revisions().next();
    tokio::spawn(async move {
        let Some(store) = state.store().await else {
            debug!(%session_id, "skipping score update in degraded mode");
            return;
        };
        match state.store_call(store.list_events(session_id, false)).await {
            Ok(events) => {
                let score = aggregate(&events, false);
                let payload = ScoreUpdateEvent {
                    session_id,
                    revision,
                    team_points: score.team_points(),
                    opponent_points: score.opponent_points(),
                    events_counted: score.events_counted,
                    line_score: score.line_score,
                };
                let published = state.score_revisions().publish_if_newer(session_id, revision, || {
                    send_live_event(state.live_sse(), EVENT_SCORE_UPDATED, &payload)
                });
                if !published {
                    debug!(%session_id, revision, "dropping superseded score update");
                }
            }
            Err(err) => warn!(%session_id, error = %err, "failed to recompute live score"),
        }
    });
}

pub(crate) fn send_live_event(hub: &SseHub, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => hub.broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize live SSE payload"),
    }
}

impl From<&SessionEntity> for SessionLifecycleEvent {
    fn from(session: &SessionEntity) -> Self {
        Self {
            session_id: session.id,
            event_id: session.event_id,
            phase: SessionPhase::of(Some(session)),
        }
    }
}
