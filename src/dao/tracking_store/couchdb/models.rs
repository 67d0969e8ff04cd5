//! Document layout of the tracking database.
//!
//! CouchDB has no secondary unique indexes, so every uniqueness constraint is a
//! pointer document whose `_id` encodes the constrained value: creating it
//! without a revision fails with `409 Conflict` when another writer got there first.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dao::models::{EventEntity, SessionEntity};

pub const SESSION_PREFIX: &str = "session::";
pub const EVENT_PREFIX: &str = "event::";
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub session: SessionEntity,
}

impl CouchSessionDocument {
    pub fn new(session: SessionEntity) -> Self {
        Self {
            id: session_doc_id(session.id),
            rev: None,
            session,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchEventDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub event: EventEntity,
}

impl CouchEventDocument {
    pub fn new(event: EventEntity) -> Self {
        Self {
            id: event_doc_id(event.session_id, event.sequence),
            rev: None,
            event,
        }
    }
}

/// Pointer document claiming a unique value on behalf of a target row.
///
/// The pointer is written before its target, so a missing target only means
/// the claim is abandoned once `claimed_at_ms` is old enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchPointerDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub target: Uuid,
    /// Milliseconds since the Unix epoch; pointers written without it count as old.
    #[serde(default)]
    pub claimed_at_ms: u64,
}

impl CouchPointerDocument {
    pub fn new(id: String, target: Uuid) -> Self {
        Self::claimed_at(id, target, SystemTime::now())
    }

    pub fn claimed_at(id: String, target: Uuid, at: SystemTime) -> Self {
        let claimed_at_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            id,
            rev: None,
            target,
            claimed_at_ms,
        }
    }

    /// Time since the claim was written; zero for clocks that went backwards.
    pub fn age(&self, now: SystemTime) -> Duration {
        let claimed = UNIX_EPOCH + Duration::from_millis(self.claimed_at_ms);
        now.duration_since(claimed).unwrap_or_default()
    }
}

pub fn session_doc_id(id: Uuid) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Sequence is zero padded so `_all_docs` returns a session's events in insertion order.
pub fn event_doc_id(session_id: Uuid, sequence: u64) -> String {
    format!("{}{sequence:020}", event_prefix(session_id))
}

pub fn event_prefix(session_id: Uuid) -> String {
    format!("{EVENT_PREFIX}{session_id}::")
}

pub fn session_key_doc_id(session_key: &str) -> String {
    format!("session_key::{session_key}")
}

pub fn active_session_doc_id(event_id: i64) -> String {
    format!("active::{event_id}")
}

pub fn idempotency_doc_id(session_id: Uuid, key: &str) -> String {
    format!("idem::{session_id}::{key}")
}
