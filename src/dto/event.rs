use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{EventEntity, EventType, ReboundKind},
    dto::{
        format_system_time,
        validation::{validate_client_key, validate_jersey},
    },
    services::{
        aggregator::points_for,
        ingestor::{EventDraft, Recorded, Retracted},
    },
};

/// Payload recording one event on an active session.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordEventRequest {
    /// Event payload.
    #[serde(flatten)]
    pub event: EventDraft,
    /// Client-generated key; resubmitting it returns the already recorded event.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Validate for RecordEventRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Some(ref key) = self.idempotency_key {
            if let Err(e) = validate_client_key(key) {
                errors.add("idempotency_key", e);
            }
        }
        if let Some(ref jersey) = self.event.opponent_jersey {
            if let Err(e) = validate_jersey(jersey) {
                errors.add("opponent_jersey", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Public projection of a recorded event.
#[derive(Debug, Serialize, ToSchema)]
pub struct EventSummary {
    /// Event identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Per-session insert sequence.
    pub sequence: u64,
    /// Credited roster player.
    pub player_id: Option<i64>,
    /// Kind of occurrence.
    pub event_type: EventType,
    /// Recorded point override.
    pub event_value: Option<u32>,
    /// Points this event contributes to its side's score.
    pub points: u32,
    /// Game period.
    pub quarter: u32,
    /// Elapsed game clock in seconds.
    pub game_time: u32,
    /// Recorded for the opposing team.
    pub is_opponent_event: bool,
    /// Opposing jersey label.
    pub opponent_jersey: Option<String>,
    /// Rebound split.
    pub rebound_kind: Option<ReboundKind>,
    /// Opaque client payload.
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    /// Client idempotency key.
    pub idempotency_key: Option<String>,
    /// RFC 3339 insert time.
    pub created_at: String,
    /// RFC 3339 retraction time.
    pub deleted_at: Option<String>,
}

impl From<EventEntity> for EventSummary {
    fn from(event: EventEntity) -> Self {
        Self {
            points: points_for(&event),
            id: event.id,
            session_id: event.session_id,
            sequence: event.sequence,
            player_id: event.player_id,
            event_type: event.event_type,
            event_value: event.event_value,
            quarter: event.quarter,
            game_time: event.game_time,
            is_opponent_event: event.is_opponent_event,
            opponent_jersey: event.opponent_jersey,
            rebound_kind: event.rebound_kind,
            metadata: event.metadata,
            idempotency_key: event.client_idempotency_key,
            created_at: format_system_time(event.created_at),
            deleted_at: event.deleted_at.map(format_system_time),
        }
    }
}

/// Answer to an event recording.
#[derive(Debug, Serialize, ToSchema)]
pub struct RecordEventResponse {
    /// Recorded or previously recorded event.
    pub event: EventSummary,
    /// The idempotency key matched an existing event, which is returned unchanged.
    pub duplicate: bool,
}

impl From<Recorded> for RecordEventResponse {
    fn from(recorded: Recorded) -> Self {
        Self {
            event: recorded.event.into(),
            duplicate: recorded.duplicate,
        }
    }
}

/// Answer to a retraction.
#[derive(Debug, Serialize, ToSchema)]
pub struct RetractEventResponse {
    /// Retracted event.
    pub event: EventSummary,
    /// The event had already been retracted.
    pub already_retracted: bool,
}

impl From<Retracted> for RetractEventResponse {
    fn from(retracted: Retracted) -> Self {
        Self {
            event: retracted.event.into(),
            already_retracted: retracted.already_retracted,
        }
    }
}

/// Query string of the event listing.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListEventsQuery {
    /// Include retracted events (audit view).
    #[serde(default)]
    pub include_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_flattens_the_event() {
        let request: RecordEventRequest = serde_json::from_str(
            r#"{"event_type":"three_made","player_id":7,"quarter":2,"game_time":300,"idempotency_key":"abc"}"#,
        )
        .unwrap();

        assert_eq!(request.event.event_type, EventType::ThreeMade);
        assert_eq!(request.event.player_id, Some(7));
        assert_eq!(request.idempotency_key.as_deref(), Some("abc"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn bad_keys_and_jerseys_are_rejected() {
        let request: RecordEventRequest = serde_json::from_str(
            r##"{"event_type":"foul","is_opponent_event":true,"opponent_jersey":"#99","quarter":1,"game_time":0,"idempotency_key":""}"##,
        )
        .unwrap();

        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("idempotency_key"));
        assert!(fields.contains_key("opponent_jersey"));
    }
}
