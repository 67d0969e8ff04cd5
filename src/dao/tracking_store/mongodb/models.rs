use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::models::{EventEntity, EventType, ReboundKind, SessionEntity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub event_id: i64,
    pub derived_game_id: Option<String>,
    pub session_key: String,
    pub is_active: bool,
    pub started_at: DateTime,
    pub ended_at: Option<DateTime>,
    pub created_by: String,
    pub next_sequence: i64,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            event_id: value.event_id,
            derived_game_id: value.derived_game_id.map(|id| id.to_string()),
            session_key: value.session_key,
            is_active: value.is_active,
            started_at: DateTime::from_system_time(value.started_at),
            ended_at: value.ended_at.map(DateTime::from_system_time),
            created_by: value.created_by,
            next_sequence: value.next_sequence as i64,
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_uuid(&value.id, &value.id)?,
            event_id: value.event_id,
            derived_game_id: value
                .derived_game_id
                .as_deref()
                .map(|game_id| parse_uuid(&value.id, game_id))
                .transpose()?,
            session_key: value.session_key,
            is_active: value.is_active,
            started_at: value.started_at.to_system_time(),
            ended_at: value.ended_at.map(|at| at.to_system_time()),
            created_by: value.created_by,
            next_sequence: value.next_sequence.max(0) as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoEventDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    pub sequence: i64,
    pub player_id: Option<i64>,
    pub event_type: EventType,
    pub event_value: Option<i64>,
    pub quarter: i64,
    pub game_time: i64,
    pub is_opponent_event: bool,
    pub opponent_jersey: Option<String>,
    pub rebound_kind: Option<ReboundKind>,
    pub metadata: Option<Value>,
    pub client_idempotency_key: Option<String>,
    /// Mirrors `deleted_at.is_none()` so the partial unique index can target live rows.
    pub live: bool,
    pub created_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

impl From<EventEntity> for MongoEventDocument {
    fn from(value: EventEntity) -> Self {
        Self {
            live: value.is_live(),
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            sequence: value.sequence as i64,
            player_id: value.player_id,
            event_type: value.event_type,
            event_value: value.event_value.map(i64::from),
            quarter: i64::from(value.quarter),
            game_time: i64::from(value.game_time),
            is_opponent_event: value.is_opponent_event,
            opponent_jersey: value.opponent_jersey,
            rebound_kind: value.rebound_kind,
            metadata: value.metadata,
            client_idempotency_key: value.client_idempotency_key,
            created_at: DateTime::from_system_time(value.created_at),
            deleted_at: value.deleted_at.map(DateTime::from_system_time),
        }
    }
}

impl TryFrom<MongoEventDocument> for EventEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoEventDocument) -> MongoResult<Self> {
        let id = parse_uuid(&value.id, &value.id)?;
        let session_id = parse_uuid(&value.id, &value.session_id)?;
        Ok(Self {
            id,
            session_id,
            sequence: value.sequence.max(0) as u64,
            player_id: value.player_id,
            event_type: value.event_type,
            event_value: value
                .event_value
                .map(|points| narrow(&value.id, "event_value", points))
                .transpose()?,
            quarter: narrow(&value.id, "quarter", value.quarter)?,
            game_time: narrow(&value.id, "game_time", value.game_time)?,
            is_opponent_event: value.is_opponent_event,
            opponent_jersey: value.opponent_jersey,
            rebound_kind: value.rebound_kind,
            metadata: value.metadata,
            client_idempotency_key: value.client_idempotency_key,
            created_at: value.created_at.to_system_time(),
            deleted_at: value.deleted_at.map(|at| at.to_system_time()),
        })
    }
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

fn parse_uuid(doc_id: &str, raw: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::InvalidDocument {
        id: doc_id.to_owned(),
        reason: format!("invalid uuid `{raw}`: {err}"),
    })
}

fn narrow(doc_id: &str, field: &str, value: i64) -> MongoResult<u32> {
    u32::try_from(value).map_err(|_| MongoDaoError::InvalidDocument {
        id: doc_id.to_owned(),
        reason: format!("field `{field}` out of range: {value}"),
    })
}
