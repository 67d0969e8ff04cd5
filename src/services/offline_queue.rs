//! Durable buffer of events recorded while the store was unreachable.
//!
//! Events are keyed by the owning session's `session_key` (the session id may
//! not exist yet) plus a client-generated idempotency key, and keep their
//! enqueue order. An event only leaves the queue once its replay is confirmed.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, sync::Mutex};

use crate::services::ingestor::EventDraft;

/// Result of queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failures of the offline queue itself, as opposed to replay failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue file could not be read.
    #[error("failed to read offline queue `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The queue file could not be written.
    #[error("failed to write offline queue `{path}`")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The queue file is not valid JSON.
    #[error("offline queue `{path}` is not valid JSON")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The queue could not be serialized.
    #[error("failed to encode offline queue")]
    Encode(#[source] serde_json::Error),
}

/// What the device knows about the session its queued events belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAnchor {
    /// Key the device chose for the session.
    pub session_key: String,
    /// Tracked scheduled event.
    pub event_id: i64,
    /// User who started tracking.
    pub created_by: String,
    /// This device started tracking offline, so it creates the session on replay if it is missing.
    pub owns_session: bool,
}

/// One buffered event awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Session key the event belongs to.
    pub session_key: String,
    /// Client key deduplicating the replay.
    pub idempotency_key: String,
    /// Enqueue order; replay follows it.
    pub client_sequence: u64,
    /// When the event was queued.
    pub recorded_at: SystemTime,
    /// Event payload.
    pub draft: EventDraft,
    /// Replays that failed permanently.
    pub attempts: u32,
    /// Last replay failure.
    pub last_error: Option<String>,
}

/// Queue of events awaiting replay.
pub trait OfflineQueue: Send + Sync {
    /// Remember how to create the session behind `anchor.session_key`.
    fn register_anchor(&self, anchor: SessionAnchor) -> BoxFuture<'static, QueueResult<()>>;
    /// Anchor registered for `session_key`.
    fn anchor(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Option<SessionAnchor>>>;
    /// Append an event. Enqueuing a known idempotency key returns the queued entry unchanged.
    fn enqueue(
        &self,
        session_key: &str,
        idempotency_key: &str,
        draft: EventDraft,
    ) -> BoxFuture<'static, QueueResult<QueuedEvent>>;
    /// Unsynced events of a session in client order.
    fn pending(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Vec<QueuedEvent>>>;
    /// Drop a replayed event; the anchor goes with the last one.
    fn mark_synced(
        &self,
        session_key: &str,
        idempotency_key: &str,
    ) -> BoxFuture<'static, QueueResult<()>>;
    /// Count a failed replay against the event and keep it queued.
    fn record_failure(
        &self,
        session_key: &str,
        idempotency_key: &str,
        error: String,
    ) -> BoxFuture<'static, QueueResult<()>>;
    /// Events still queued, all sessions included.
    fn pending_count(&self) -> BoxFuture<'static, QueueResult<usize>>;
    /// Session keys with at least one unsynced event.
    fn session_keys(&self) -> BoxFuture<'static, QueueResult<Vec<String>>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_sequence: u64,
    anchors: BTreeMap<String, SessionAnchor>,
    events: Vec<QueuedEvent>,
}

impl QueueState {
    fn position(&self, session_key: &str, idempotency_key: &str) -> Option<usize> {
        self.events.iter().position(|event| {
            event.session_key == session_key && event.idempotency_key == idempotency_key
        })
    }

    fn enqueue(&mut self, session_key: String, idempotency_key: String, draft: EventDraft) -> QueuedEvent {
        if let Some(index) = self.position(&session_key, &idempotency_key) {
            return self.events[index].clone();
        }

        self.next_sequence += 1;
        let event = QueuedEvent {
            session_key,
            idempotency_key,
            client_sequence: self.next_sequence,
            recorded_at: SystemTime::now(),
            draft,
            attempts: 0,
            last_error: None,
        };
        self.events.push(event.clone());
        event
    }

    fn pending(&self, session_key: &str) -> Vec<QueuedEvent> {
        let mut events = self
            .events
            .iter()
            .filter(|event| event.session_key == session_key)
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by_key(|event| event.client_sequence);
        events
    }

    fn mark_synced(&mut self, session_key: &str, idempotency_key: &str) {
        if let Some(index) = self.position(session_key, idempotency_key) {
            self.events.remove(index);
        }
        if !self.events.iter().any(|event| event.session_key == session_key) {
            self.anchors.remove(session_key);
        }
    }

    fn record_failure(&mut self, session_key: &str, idempotency_key: &str, error: String) {
        if let Some(index) = self.position(session_key, idempotency_key) {
            let event = &mut self.events[index];
            event.attempts += 1;
            event.last_error = Some(error);
        }
    }

    fn session_keys(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|event| event.session_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Shared queue state, optionally mirrored to a JSON file after every mutation.
#[derive(Clone)]
struct QueueCore {
    state: Arc<Mutex<QueueState>>,
    path: Option<Arc<PathBuf>>,
}

impl QueueCore {
    fn read<R, F>(&self, read: F) -> BoxFuture<'static, QueueResult<R>>
    where
        F: FnOnce(&QueueState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let core = self.clone();
        Box::pin(async move {
            let guard = core.state.lock().await;
            Ok(read(&guard))
        })
    }

    /// Apply `mutate`; file-backed queues only commit in memory once the file write succeeded.
    fn mutate<R, F>(&self, mutate: F) -> BoxFuture<'static, QueueResult<R>>
    where
        F: FnOnce(&mut QueueState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let core = self.clone();
        Box::pin(async move {
            let mut guard = core.state.lock().await;
            let Some(path) = core.path.as_deref() else {
                return Ok(mutate(&mut guard));
            };

            let mut next = guard.clone();
            let output = mutate(&mut next);
            persist(path, &next).await?;
            *guard = next;
            Ok(output)
        })
    }

    fn register_anchor(&self, anchor: SessionAnchor) -> BoxFuture<'static, QueueResult<()>> {
        self.mutate(move |state| {
            state.anchors.insert(anchor.session_key.clone(), anchor);
        })
    }

    fn anchor(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Option<SessionAnchor>>> {
        let session_key = session_key.to_string();
        self.read(move |state| state.anchors.get(&session_key).cloned())
    }

    fn enqueue(
        &self,
        session_key: &str,
        idempotency_key: &str,
        draft: EventDraft,
    ) -> BoxFuture<'static, QueueResult<QueuedEvent>> {
        let (session_key, idempotency_key) = (session_key.to_string(), idempotency_key.to_string());
        self.mutate(move |state| state.enqueue(session_key, idempotency_key, draft))
    }

    fn pending(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Vec<QueuedEvent>>> {
        let session_key = session_key.to_string();
        self.read(move |state| state.pending(&session_key))
    }

    fn mark_synced(&self, session_key: &str, idempotency_key: &str) -> BoxFuture<'static, QueueResult<()>> {
        let (session_key, idempotency_key) = (session_key.to_string(), idempotency_key.to_string());
        self.mutate(move |state| state.mark_synced(&session_key, &idempotency_key))
    }

    fn record_failure(
        &self,
        session_key: &str,
        idempotency_key: &str,
        error: String,
    ) -> BoxFuture<'static, QueueResult<()>> {
        let (session_key, idempotency_key) = (session_key.to_string(), idempotency_key.to_string());
        self.mutate(move |state| state.record_failure(&session_key, &idempotency_key, error))
    }

    fn pending_count(&self) -> BoxFuture<'static, QueueResult<usize>> {
        self.read(|state| state.events.len())
    }

    fn session_keys(&self) -> BoxFuture<'static, QueueResult<Vec<String>>> {
        self.read(QueueState::session_keys)
    }
}

/// Write through a temporary sibling file so a crash never leaves a truncated queue.
async fn persist(path: &Path, state: &QueueState) -> QueueResult<()> {
    let bytes = serde_json::to_vec_pretty(state).map_err(QueueError::Encode)?;
    let write_error = |source| QueueError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(write_error)?;
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes).await.map_err(write_error)?;
    fs::rename(&temp, path).await.map_err(write_error)
}

/// Queue kept in process memory only.
#[derive(Clone)]
pub struct MemoryOfflineQueue {
    core: QueueCore,
}

impl Default for MemoryOfflineQueue {
    fn default() -> Self {
        Self {
            core: QueueCore {
                state: Arc::default(),
                path: None,
            },
        }
    }
}

impl MemoryOfflineQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Queue persisted as a JSON document, surviving restarts.
#[derive(Clone)]
pub struct FileOfflineQueue {
    core: QueueCore,
}

impl FileOfflineQueue {
    /// Open the queue stored at `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> QueueResult<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| QueueError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => QueueState::default(),
            Err(source) => return Err(QueueError::Read { path, source }),
        };

        Ok(Self {
            core: QueueCore {
                state: Arc::new(Mutex::new(state)),
                path: Some(Arc::new(path)),
            },
        })
    }
}

impl OfflineQueue for MemoryOfflineQueue {
    fn register_anchor(&self, anchor: SessionAnchor) -> BoxFuture<'static, QueueResult<()>> {
        self.core.register_anchor(anchor)
    }

    fn anchor(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Option<SessionAnchor>>> {
        self.core.anchor(session_key)
    }

    fn enqueue(
        &self,
        session_key: &str,
        idempotency_key: &str,
        draft: EventDraft,
    ) -> BoxFuture<'static, QueueResult<QueuedEvent>> {
        self.core.enqueue(session_key, idempotency_key, draft)
    }

    fn pending(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Vec<QueuedEvent>>> {
        self.core.pending(session_key)
    }

    fn mark_synced(&self, session_key: &str, idempotency_key: &str) -> BoxFuture<'static, QueueResult<()>> {
        self.core.mark_synced(session_key, idempotency_key)
    }

    fn record_failure(
        &self,
        session_key: &str,
        idempotency_key: &str,
        error: String,
    ) -> BoxFuture<'static, QueueResult<()>> {
        self.core.record_failure(session_key, idempotency_key, error)
    }

    fn pending_count(&self) -> BoxFuture<'static, QueueResult<usize>> {
        self.core.pending_count()
    }

    fn session_keys(&self) -> BoxFuture<'static, QueueResult<Vec<String>>> {
        self.core.session_keys()
    }
}

impl OfflineQueue for FileOfflineQueue {
    fn register_anchor(&self, anchor: SessionAnchor) -> BoxFuture<'static, QueueResult<()>> {
        self.core.register_anchor(anchor)
    }

    fn anchor(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Option<SessionAnchor>>> {
        self.core.anchor(session_key)
    }

    fn enqueue(
        &self,
        session_key: &str,
        idempotency_key: &str,
        draft: EventDraft,
    ) -> BoxFuture<'static, QueueResult<QueuedEvent>> {
        self.core.enqueue(session_key, idempotency_key, draft)
    }

    fn pending(&self, session_key: &str) -> BoxFuture<'static, QueueResult<Vec<QueuedEvent>>> {
        self.core.pending(session_key)
    }

    fn mark_synced(&self, session_key: &str, idempotency_key: &str) -> BoxFuture<'static, QueueResult<()>> {
        self.core.mark_synced(session_key, idempotency_key)
    }

    fn record_failure(
        &self,
        session_key: &str,
        idempotency_key: &str,
        error: String,
    ) -> BoxFuture<'static, QueueResult<()>> {
        self.core.record_failure(session_key, idempotency_key, error)
    }

    fn pending_count(&self) -> BoxFuture<'static, QueueResult<usize>> {
        self.core.pending_count()
    }

    fn session_keys(&self) -> BoxFuture<'static, QueueResult<Vec<String>>> {
        self.core.session_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::EventType;

    fn three(player_id: i64) -> EventDraft {
        EventDraft {
            player_id: Some(player_id),
            event_type: EventType::ThreeMade,
            event_value: None,
            quarter: 2,
            game_time: 410,
            is_opponent_event: false,
            opponent_jersey: None,
            rebound_kind: None,
            metadata: None,
        }
    }

    fn temp_queue_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("courtside-queue-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn keeps_client_order_and_ignores_repeated_keys() {
        let queue = MemoryOfflineQueue::new();
        queue.enqueue("s1", "b", three(7)).await.unwrap();
        queue.enqueue("s1", "a", three(8)).await.unwrap();
        let repeated = queue.enqueue("s1", "b", three(9)).await.unwrap();

        assert_eq!(repeated.draft.player_id, Some(7));
        let keys = queue
            .pending("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.idempotency_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn only_synced_events_leave_the_queue() {
        let queue = MemoryOfflineQueue::new();
        queue
            .register_anchor(SessionAnchor {
                session_key: "s1".into(),
                event_id: 16,
                created_by: "coach".into(),
                owns_session: true,
            })
            .await
            .unwrap();
        queue.enqueue("s1", "a", three(7)).await.unwrap();
        queue.enqueue("s1", "b", three(7)).await.unwrap();

        queue.record_failure("s1", "a", "boom".into()).await.unwrap();
        queue.mark_synced("s1", "b").await.unwrap();

        let pending = queue.pending("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("boom"));
        assert!(queue.anchor("s1").await.unwrap().is_some());

        queue.mark_synced("s1", "a").await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(queue.session_keys().await.unwrap().is_empty());
        assert!(queue.anchor("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_queue_survives_reopen() {
        let path = temp_queue_path("queue.json");
        {
            let queue = FileOfflineQueue::open(&path).await.unwrap();
            queue.enqueue("s1", "abc", three(7)).await.unwrap();
            queue.enqueue("s2", "def", three(7)).await.unwrap();
            queue.mark_synced("s2", "def").await.unwrap();
        }

        let reopened = FileOfflineQueue::open(&path).await.unwrap();
        assert_eq!(reopened.session_keys().await.unwrap(), vec!["s1"]);
        let next = reopened.enqueue("s1", "ghi", three(7)).await.unwrap();
        assert_eq!(next.client_sequence, 3);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let path = temp_queue_path("queue.json");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, b"not json").unwrap();

        let err = FileOfflineQueue::open(&path).await.err().unwrap();
        assert!(matches!(err, QueueError::Corrupt { .. }));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
