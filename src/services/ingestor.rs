use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::{
        models::{EventEntity, EventType, NewEvent, ReboundKind},
        storage::IDEMPOTENCY_KEY_CONSTRAINT,
    },
    error::ServiceError,
    services::{session_registry, sse_events},
    state::{
        SharedState,
        session_machine::{self, SessionAction, SessionPhase},
    },
};

/// Largest point override accepted on a made shot.
pub const MAX_EVENT_VALUE: u32 = 10;

/// Client-side description of one event, as recorded online or queued offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventDraft {
    /// Credited roster player; required for own-team events.
    #[serde(default)]
    pub player_id: Option<i64>,
    /// Kind of occurrence.
    pub event_type: EventType,
    /// Point override, allowed on made shots only.
    #[serde(default)]
    pub event_value: Option<u32>,
    /// Game period, starting at 1.
    pub quarter: u32,
    /// Elapsed game clock in seconds.
    pub game_time: u32,
    /// Recorded for the opposing team.
    #[serde(default)]
    pub is_opponent_event: bool,
    /// Opposing jersey label.
    #[serde(default)]
    pub opponent_jersey: Option<String>,
    /// Rebound split.
    #[serde(default)]
    pub rebound_kind: Option<ReboundKind>,
    /// Opaque pass-through payload.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
}

impl EventDraft {
    /// Check the rules that do not need the store or the roster.
    pub fn check_shape(&self) -> Result<(), ServiceError> {
        if self.quarter < 1 {
            return Err(ServiceError::InvalidInput("quarter must be at least 1".into()));
        }
        if self.event_value.is_some() && !self.event_type.is_made_shot() {
            return Err(ServiceError::InvalidInput(format!(
                "event_value is only allowed on made shots, not {:?}",
                self.event_type
            )));
        }
        if self.event_value.is_some_and(|value| value > MAX_EVENT_VALUE) {
            return Err(ServiceError::InvalidInput(format!(
                "event_value must be at most {MAX_EVENT_VALUE}"
            )));
        }
        if self.rebound_kind.is_some() && self.event_type != EventType::Rebound {
            return Err(ServiceError::InvalidInput(
                "rebound_kind is only allowed on rebounds".into(),
            ));
        }
        if self.is_opponent_event {
            if self.player_id.is_some() {
                return Err(ServiceError::InvalidInput(
                    "opponent events cannot reference a roster player".into(),
                ));
            }
        } else {
            if self.player_id.is_none() {
                return Err(ServiceError::InvalidInput(
                    "own-team events require a player_id".into(),
                ));
            }
            if self.opponent_jersey.is_some() {
                return Err(ServiceError::InvalidInput(
                    "opponent_jersey is only allowed on opponent events".into(),
                ));
            }
        }
        Ok(())
    }

    fn into_new_event(self, session_id: Uuid, idempotency_key: Option<String>) -> NewEvent {
        NewEvent {
            session_id,
            player_id: self.player_id,
            event_type: self.event_type,
            event_value: self.event_value,
            quarter: self.quarter,
            game_time: self.game_time,
            is_opponent_event: self.is_opponent_event,
            opponent_jersey: self.opponent_jersey,
            rebound_kind: self.rebound_kind,
            metadata: self.metadata,
            client_idempotency_key: idempotency_key,
        }
    }
}

/// Result of a record call.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// Stored event.
    pub event: EventEntity,
    /// The idempotency key matched an existing live event, which is returned instead.
    pub duplicate: bool,
}

/// Result of a retraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Retracted {
    /// Retracted event.
    pub event: EventEntity,
    /// The event was retracted before this call.
    pub already_retracted: bool,
}

/// Validate and append one event to an active session.
pub async fn record_event(
    state: &SharedState,
    session_id: Uuid,
    draft: EventDraft,
    idempotency_key: Option<String>,
) -> Result<Recorded, ServiceError> {
    draft.check_shape()?;

    let _gate = state.session_gates().shared(&session_id).await;
    let session = session_registry::get_session(state, session_id).await?;
    session_machine::plan(SessionPhase::of(Some(&session)), SessionAction::Record)?;

    let store = state.require_store().await?;
    if let Some(key) = idempotency_key.as_deref() {
        let existing = state
            .store_call(store.find_event_by_idempotency_key(session_id, key.to_string()))
            .await?;
        if let Some(event) = existing {
            debug!(%session_id, event_id = %event.id, key, "idempotent replay of recorded event");
            return Ok(Recorded {
                event,
                duplicate: true,
            });
        }
    }

    if let Some(player_id) = draft.player_id {
        if !state.store_call(state.roster().player_exists(player_id)).await? {
            return Err(ServiceError::PlayerNotFound(player_id));
        }
    } else if draft.is_opponent_event && draft.opponent_jersey.is_none() {
        warn!(%session_id, "opponent event recorded without a jersey");
    }

    session_registry::ensure_game_record(state, &session).await?;

    let insert = store.insert_event(draft.into_new_event(session_id, idempotency_key.clone()));
    let recorded = match state.store_call(insert).await {
        Ok(event) => Recorded {
            event,
            duplicate: false,
        },
        Err(ServiceError::StoreConflict { constraint })
            if constraint == IDEMPOTENCY_KEY_CONSTRAINT =>
        {
            let key = idempotency_key.unwrap_or_default();
            let winner = state
                .store_call(store.find_event_by_idempotency_key(session_id, key))
                .await?
                .ok_or(ServiceError::StoreConflict { constraint })?;
            return Ok(Recorded {
                event: winner,
                duplicate: true,
            });
        }
        Err(err) => return Err(err),
    };

    info!(
        %session_id,
        event_id = %recorded.event.id,
        sequence = recorded.event.sequence,
        event_type = ?recorded.event.event_type,
        "event recorded"
    );
    sse_events::spawn_score_update(state.clone(), session_id);
    Ok(recorded)
}

/// Soft-delete an event of an active session.
pub async fn retract_event(
    state: &SharedState,
    session_id: Uuid,
    event_id: Uuid,
) -> Result<Retracted, ServiceError> {
    let _gate = state.session_gates().shared(&session_id).await;
    let session = session_registry::get_session(state, session_id).await?;
    session_machine::plan(SessionPhase::of(Some(&session)), SessionAction::Record)?;

    let store = state.require_store().await?;
    let current = state
        .store_call(store.find_event(session_id, event_id))
        .await?
        .ok_or(ServiceError::EventNotFound(event_id))?;
    if !current.is_live() {
        return Ok(Retracted {
            event: current,
            already_retracted: true,
        });
    }

    let event = state
        .store_call(store.soft_delete_event(session_id, event_id, SystemTime::now()))
        .await?
        .ok_or(ServiceError::EventNotFound(event_id))?;

    info!(%session_id, %event_id, "event retracted");
    sse_events::spawn_score_update(state.clone(), session_id);
    Ok(Retracted {
        event,
        already_retracted: false,
    })
}

/// Events of a session in aggregation order, optionally including retracted ones.
pub async fn list_events(
    state: &SharedState,
    session_id: Uuid,
    include_deleted: bool,
) -> Result<Vec<EventEntity>, ServiceError> {
    let session = session_registry::get_session(state, session_id).await?;
    let store = state.require_store().await?;
    state
        .store_call(store.list_events(session.id, include_deleted))
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{NewSession, RosterPlayer},
            tracking_store::MemoryTrackingStore,
        },
        state::AppState,
    };

    pub(crate) fn draft(player_id: Option<i64>, event_type: EventType) -> EventDraft {
        EventDraft {
            player_id,
            event_type,
            event_value: None,
            quarter: 1,
            game_time: 30,
            is_opponent_event: player_id.is_none(),
            opponent_jersey: player_id.is_none().then(|| "4".to_string()),
            rebound_kind: None,
            metadata: None,
        }
    }

    async fn active_session() -> (SharedState, MemoryTrackingStore, Uuid) {
        let config = AppConfig {
            roster: vec![RosterPlayer {
                id: 18,
                name: "Ada".into(),
                jersey: Some("18".into()),
            }],
            ..AppConfig::default()
        };
        let state = AppState::new(config);
        let store = MemoryTrackingStore::new();
        state.set_store(Arc::new(store.clone())).await;
        let session = session_registry::start_session(
            &state,
            NewSession {
                event_id: 16,
                session_key: "tablet-a".into(),
                created_by: "coach".into(),
            },
        )
        .await
        .unwrap()
        .into_session();
        (state, store, session.id)
    }

    #[test]
    fn shape_rules() {
        let mut bad_quarter = draft(Some(18), EventType::FgMade);
        bad_quarter.quarter = 0;
        assert!(matches!(
            bad_quarter.check_shape(),
            Err(ServiceError::InvalidInput(_))
        ));

        let mut value_on_rebound = draft(Some(18), EventType::Rebound);
        value_on_rebound.event_value = Some(2);
        assert!(value_on_rebound.check_shape().is_err());

        let mut kind_on_steal = draft(Some(18), EventType::Steal);
        kind_on_steal.rebound_kind = Some(ReboundKind::Defensive);
        assert!(kind_on_steal.check_shape().is_err());

        let mut opponent_with_player = draft(None, EventType::FgMade);
        opponent_with_player.player_id = Some(18);
        assert!(opponent_with_player.check_shape().is_err());

        let mut own_with_jersey = draft(Some(18), EventType::FgMade);
        own_with_jersey.opponent_jersey = Some("9".into());
        assert!(own_with_jersey.check_shape().is_err());

        assert!(draft(None, EventType::Foul).check_shape().is_ok());

        let mut and_one = draft(Some(18), EventType::FgMade);
        and_one.event_value = Some(MAX_EVENT_VALUE);
        assert!(and_one.check_shape().is_ok());
    }

    #[tokio::test]
    async fn oversized_point_override_is_rejected() {
        let (state, _, session_id) = active_session().await;
        let mut huge = draft(None, EventType::FgMade);
        huge.event_value = Some(u32::MAX);

        let err = record_event(&state, session_id, huge, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert!(list_events(&state, session_id, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_with_increasing_sequence_and_game_record() {
        let (state, _, session_id) = active_session().await;
        let first = record_event(&state, session_id, draft(Some(18), EventType::FgMade), None)
            .await
            .unwrap();
        let second = record_event(&state, session_id, draft(None, EventType::FgMade), None)
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.event.sequence > first.event.sequence);
        let session = session_registry::get_session(&state, session_id)
            .await
            .unwrap();
        assert!(session.derived_game_id.is_some());
    }

    #[tokio::test]
    async fn unknown_player_is_rejected() {
        let (state, _, session_id) = active_session().await;
        let err = record_event(&state, session_id, draft(Some(99), EventType::FgMade), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PlayerNotFound(99)));
    }

    #[tokio::test]
    async fn idempotency_key_returns_the_existing_event() {
        let (state, _, session_id) = active_session().await;
        let key = Some("abc".to_string());
        let first = record_event(&state, session_id, draft(Some(18), EventType::ThreeMade), key.clone())
            .await
            .unwrap();
        let again = record_event(&state, session_id, draft(Some(18), EventType::ThreeMade), key)
            .await
            .unwrap();

        assert!(again.duplicate);
        assert_eq!(again.event.id, first.event.id);
        assert_eq!(list_events(&state, session_id, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failures_surface_as_transient() {
        let (state, store, session_id) = active_session().await;
        store.fail_next_inserts(1);
        let err = record_event(&state, session_id, draft(Some(18), EventType::Foul), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let retried = record_event(&state, session_id, draft(Some(18), EventType::Foul), None).await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn retraction_is_idempotent_and_audited() {
        let (state, _, session_id) = active_session().await;
        let recorded = record_event(&state, session_id, draft(None, EventType::FgMade), None)
            .await
            .unwrap();

        let first = retract_event(&state, session_id, recorded.event.id).await.unwrap();
        assert!(!first.already_retracted);
        let second = retract_event(&state, session_id, recorded.event.id).await.unwrap();
        assert!(second.already_retracted);

        assert!(list_events(&state, session_id, false).await.unwrap().is_empty());
        assert_eq!(list_events(&state, session_id, true).await.unwrap().len(), 1);

        let err = retract_event(&state, session_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::EventNotFound(_)));
    }

    #[tokio::test]
    async fn completed_sessions_reject_events() {
        let (state, _, session_id) = active_session().await;
        session_registry::complete_session(&state, session_id)
            .await
            .unwrap();

        let err = record_event(&state, session_id, draft(Some(18), EventType::FgMade), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SessionNotActive(_)));
    }
}
