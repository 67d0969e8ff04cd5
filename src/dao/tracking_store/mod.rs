#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::{cmp::Ordering, time::SystemTime};

use crate::dao::models::{EventEntity, NewEvent, NewSession, SessionEntity};
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;
use uuid::Uuid;

pub use memory::MemoryTrackingStore;

/// Abstraction over the persistence layer for tracking sessions and their events.
///
/// Every operation is atomic at the single-row level. Uniqueness violations
/// (second active session for an event, reused session key, reused idempotency
/// key inside a session) are reported as [`StorageError::Conflict`].
///
/// [`StorageError::Conflict`]: crate::dao::storage::StorageError::Conflict
pub trait TrackingStore: Send + Sync {
    /// Insert a new active session.
    fn create_session(&self, session: NewSession) -> BoxFuture<'static, StorageResult<SessionEntity>>;
    /// Flip an active session to completed. Returns the current row, or `None` if unknown.
    fn complete_session(
        &self,
        id: Uuid,
        ended_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Set `derived_game_id` only if it is still empty. Returns the current row.
    fn attach_game(
        &self,
        id: Uuid,
        game_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Session by id.
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// The active session of a scheduled event, if any.
    fn find_active_session_by_event(
        &self,
        event_id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Session by its client key.
    fn find_session_by_key(
        &self,
        session_key: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Completed sessions ordered by `started_at`.
    fn list_completed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>>;
    /// Append an event, assigning its sequence.
    fn insert_event(&self, event: NewEvent) -> BoxFuture<'static, StorageResult<EventEntity>>;
    /// Event of a session by id, retracted ones included.
    fn find_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>>;
    /// Live (non-retracted) event of the session carrying `key`.
    fn find_event_by_idempotency_key(
        &self,
        session_id: Uuid,
        key: String,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>>;
    /// Mark an event retracted. Already retracted events are returned unchanged.
    fn soft_delete_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
        deleted_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>>;
    /// Events of the session in aggregation order.
    fn list_events(
        &self,
        session_id: Uuid,
        include_deleted: bool,
    ) -> BoxFuture<'static, StorageResult<Vec<EventEntity>>>;
    /// Cheap round trip proving the backend answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Canonical event ordering: creation time, then per-session sequence, then id.
pub fn event_order(a: &EventEntity, b: &EventEntity) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then(a.sequence.cmp(&b.sequence))
        .then(a.id.cmp(&b.id))
}
