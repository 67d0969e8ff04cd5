//! In-process store used by tests and by deployments that do not need durability.
//!
//! Uniqueness constraints are enforced under a single write lock, which gives the
//! same single-row atomicity guarantees the database backends provide.

use std::{collections::HashMap, io, sync::Arc, time::SystemTime};
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{TrackingStore, event_order};
use crate::dao::{
    models::{EventEntity, NewEvent, NewSession, SessionEntity},
    storage::{
        ACTIVE_SESSION_CONSTRAINT, IDEMPOTENCY_KEY_CONSTRAINT, SESSION_KEY_CONSTRAINT,
        StorageError, StorageResult,
    },
};

/// [`TrackingStore`] kept entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryTrackingStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: RwLock<MemoryState>,
    #[cfg(test)]
    failing_inserts: AtomicU32,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, SessionEntity>,
    events: HashMap<Uuid, Vec<EventEntity>>,
}

impl MemoryTrackingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` event inserts fail as if the backend dropped the connection.
    #[cfg(test)]
    pub(crate) fn fail_next_inserts(&self, count: u32) {
        self.inner.failing_inserts.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.inner
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    #[cfg(not(test))]
    fn take_injected_failure(&self) -> bool {
        false
    }
}

impl MemoryState {
    fn active_for_event(&self, event_id: i64) -> Option<&SessionEntity> {
        self.sessions
            .values()
            .find(|session| session.event_id == event_id && session.is_active)
    }

    fn live_event_with_key(&self, session_id: Uuid, key: &str) -> Option<&EventEntity> {
        self.events.get(&session_id)?.iter().find(|event| {
            event.is_live() && event.client_idempotency_key.as_deref() == Some(key)
        })
    }
}

impl TrackingStore for MemoryTrackingStore {
    fn create_session(&self, session: NewSession) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.inner.state.write().await;
            if state
                .sessions
                .values()
                .any(|existing| existing.session_key == session.session_key)
            {
                return Err(StorageError::conflict(SESSION_KEY_CONSTRAINT));
            }
            if state.active_for_event(session.event_id).is_some() {
                return Err(StorageError::conflict(ACTIVE_SESSION_CONSTRAINT));
            }

            let entity = session.into_entity(Uuid::new_v4(), SystemTime::now());
            state.sessions.insert(entity.id, entity.clone());
            Ok(entity)
        })
    }

    fn complete_session(
        &self,
        id: Uuid,
        ended_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.inner.state.write().await;
            Ok(state.sessions.get_mut(&id).map(|session| {
                if session.is_active {
                    session.is_active = false;
                    session.ended_at = Some(ended_at);
                }
                session.clone()
            }))
        })
    }

    fn attach_game(
        &self,
        id: Uuid,
        game_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.inner.state.write().await;
            Ok(state.sessions.get_mut(&id).map(|session| {
                session.derived_game_id.get_or_insert(game_id);
                session.clone()
            }))
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            Ok(state.sessions.get(&id).cloned())
        })
    }

    fn find_active_session_by_event(
        &self,
        event_id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            Ok(state.active_for_event(event_id).cloned())
        })
    }

    fn find_session_by_key(
        &self,
        session_key: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            Ok(state
                .sessions
                .values()
                .find(|session| session.session_key == session_key)
                .cloned())
        })
    }

    fn list_completed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            let mut sessions = state
                .sessions
                .values()
                .filter(|session| !session.is_active)
                .cloned()
                .collect::<Vec<_>>();
            sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
            Ok(sessions)
        })
    }

    fn insert_event(&self, event: NewEvent) -> BoxFuture<'static, StorageResult<EventEntity>> {
        let store = self.clone();
        Box::pin(async move {
            if store.take_injected_failure() {
                return Err(StorageError::unavailable(
                    "memory store insert failed".into(),
                    io::Error::new(io::ErrorKind::ConnectionReset, "injected failure"),
                ));
            }

            let mut state = store.inner.state.write().await;
            if let Some(key) = event.client_idempotency_key.as_deref() {
                if state.live_event_with_key(event.session_id, key).is_some() {
                    return Err(StorageError::conflict(IDEMPOTENCY_KEY_CONSTRAINT));
                }
            }

            let Some(session) = state.sessions.get_mut(&event.session_id) else {
                return Err(StorageError::unavailable(
                    format!("session `{}` vanished during insert", event.session_id),
                    io::Error::new(io::ErrorKind::NotFound, "missing session row"),
                ));
            };
            session.next_sequence += 1;
            let sequence = session.next_sequence;

            let entity = event.into_entity(Uuid::new_v4(), sequence, SystemTime::now());
            state
                .events
                .entry(entity.session_id)
                .or_default()
                .push(entity.clone());
            Ok(entity)
        })
    }

    fn find_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            Ok(state
                .events
                .get(&session_id)
                .and_then(|events| events.iter().find(|event| event.id == event_id))
                .cloned())
        })
    }

    fn find_event_by_idempotency_key(
        &self,
        session_id: Uuid,
        key: String,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            Ok(state.live_event_with_key(session_id, &key).cloned())
        })
    }

    fn soft_delete_event(
        &self,
        session_id: Uuid,
        event_id: Uuid,
        deleted_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Option<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.inner.state.write().await;
            Ok(state
                .events
                .get_mut(&session_id)
                .and_then(|events| events.iter_mut().find(|event| event.id == event_id))
                .map(|event| {
                    event.deleted_at.get_or_insert(deleted_at);
                    event.clone()
                }))
        })
    }

    fn list_events(
        &self,
        session_id: Uuid,
        include_deleted: bool,
    ) -> BoxFuture<'static, StorageResult<Vec<EventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.inner.state.read().await;
            let mut events = state
                .events
                .get(&session_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| include_deleted || event.is_live())
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            events.sort_by(event_order);
            Ok(events)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::EventType;

    fn new_session(event_id: i64, key: &str) -> NewSession {
        NewSession {
            event_id,
            session_key: key.into(),
            created_by: "coach".into(),
        }
    }

    fn new_event(session_id: Uuid, key: Option<&str>) -> NewEvent {
        NewEvent {
            session_id,
            player_id: Some(18),
            event_type: EventType::FgMade,
            event_value: None,
            quarter: 1,
            game_time: 30,
            is_opponent_event: false,
            opponent_jersey: None,
            rebound_kind: None,
            metadata: None,
            client_idempotency_key: key.map(Into::into),
        }
    }

    #[tokio::test]
    async fn second_active_session_for_event_is_rejected() {
        let store = MemoryTrackingStore::new();
        store.create_session(new_session(16, "a")).await.unwrap();

        let err = store.create_session(new_session(16, "b")).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                constraint: ACTIVE_SESSION_CONSTRAINT
            }
        ));
    }

    #[tokio::test]
    async fn completed_session_frees_the_event() {
        let store = MemoryTrackingStore::new();
        let first = store.create_session(new_session(16, "a")).await.unwrap();
        store
            .complete_session(first.id, SystemTime::now())
            .await
            .unwrap();

        let second = store.create_session(new_session(16, "b")).await.unwrap();
        assert!(second.is_active);
    }

    #[tokio::test]
    async fn session_keys_are_never_reused() {
        let store = MemoryTrackingStore::new();
        let first = store.create_session(new_session(16, "a")).await.unwrap();
        store
            .complete_session(first.id, SystemTime::now())
            .await
            .unwrap();

        let err = store.create_session(new_session(17, "a")).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                constraint: SESSION_KEY_CONSTRAINT
            }
        ));
    }

    #[tokio::test]
    async fn sequences_increase_per_session() {
        let store = MemoryTrackingStore::new();
        let session = store.create_session(new_session(16, "a")).await.unwrap();

        let first = store.insert_event(new_event(session.id, None)).await.unwrap();
        let second = store.insert_event(new_event(session.id, None)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn idempotency_key_is_unique_among_live_events() {
        let store = MemoryTrackingStore::new();
        let session = store.create_session(new_session(16, "a")).await.unwrap();
        let event = store
            .insert_event(new_event(session.id, Some("k1")))
            .await
            .unwrap();

        let err = store
            .insert_event(new_event(session.id, Some("k1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        store
            .soft_delete_event(session.id, event.id, SystemTime::now())
            .await
            .unwrap();
        assert!(
            store
                .insert_event(new_event(session.id, Some("k1")))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryTrackingStore::new();
        let session = store.create_session(new_session(16, "a")).await.unwrap();
        store.fail_next_inserts(1);

        assert!(store.insert_event(new_event(session.id, None)).await.is_err());
        assert!(store.insert_event(new_event(session.id, None)).await.is_ok());
    }
}
