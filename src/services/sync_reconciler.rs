//! Replays offline-queued events through the ingestor once a device reconnects.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::NewSession,
    error::ServiceError,
    services::{
        ingestor::{self, EventDraft},
        offline_queue::{OfflineQueue, QueuedEvent, SessionAnchor},
        session_registry,
    },
    state::{
        KeyedGate, SharedState,
        session_machine::{self, SessionAction, SessionPhase},
    },
};

/// What the target did with one replayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The event was stored under this id.
    Recorded(Uuid),
    /// The idempotency key was already recorded; carries the existing event id.
    Duplicate(Uuid),
}

/// Destination of replayed events.
pub trait ReplayTarget: Send + Sync {
    /// Map a queued session key to the server-side session id.
    fn resolve_session(
        &self,
        session_key: String,
        anchor: Option<SessionAnchor>,
    ) -> BoxFuture<'static, Result<Uuid, ServiceError>>;

    /// Record one queued event under its idempotency key.
    fn replay(
        &self,
        session_id: Uuid,
        idempotency_key: String,
        draft: EventDraft,
    ) -> BoxFuture<'static, Result<ReplayOutcome, ServiceError>>;
}

/// Replays into this process's registry and ingestor.
#[derive(Clone)]
pub struct ServiceReplayTarget {
    state: SharedState,
}

impl ServiceReplayTarget {
    /// Target writing through the services of `state`.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

impl ReplayTarget for ServiceReplayTarget {
    fn resolve_session(
        &self,
        session_key: String,
        anchor: Option<SessionAnchor>,
    ) -> BoxFuture<'static, Result<Uuid, ServiceError>> {
        let state = self.state.clone();
        Box::pin(async move {
            if let Some(session) = session_registry::find_session_by_key(&state, &session_key).await? {
                session_machine::plan(SessionPhase::of(Some(&session)), SessionAction::Record)?;
                return Ok(session.id);
            }

            let Some(anchor) = anchor else {
                return Err(ServiceError::SessionNotFound(session_key));
            };
            if anchor.owns_session {
                let outcome = session_registry::start_session(
                    &state,
                    NewSession {
                        event_id: anchor.event_id,
                        session_key: anchor.session_key,
                        created_by: anchor.created_by,
                    },
                )
                .await?;
                return Ok(outcome.session().id);
            }

            session_registry::active_session_for_event(&state, anchor.event_id)
                .await?
                .map(|session| session.id)
                .ok_or(ServiceError::SessionNotFound(session_key))
        })
    }

    fn replay(
        &self,
        session_id: Uuid,
        idempotency_key: String,
        draft: EventDraft,
    ) -> BoxFuture<'static, Result<ReplayOutcome, ServiceError>> {
        let state = self.state.clone();
        Box::pin(async move {
            let recorded = ingestor::record_event(&state, session_id, draft, Some(idempotency_key)).await?;
            Ok(if recorded.duplicate {
                ReplayOutcome::Duplicate(recorded.event.id)
            } else {
                ReplayOutcome::Recorded(recorded.event.id)
            })
        })
    }
}

/// Per-event replay status reported back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// Recorded by this replay.
    Synced,
    /// Already recorded by an earlier replay.
    Duplicate,
    /// Rejected; the failure was counted against the event.
    Failed,
    /// Out of replay attempts; left in the queue for manual review.
    Exhausted,
    /// Not replayed because the store is unreachable; retried on the next pass.
    Queued,
}

/// Outcome of one queued event.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EventReplay {
    /// Client key of the event.
    pub idempotency_key: String,
    /// Order the device recorded it in.
    pub client_sequence: u64,
    /// What happened to it.
    pub status: ReplayStatus,
    /// Server-side event id for synced and duplicate events.
    pub event_id: Option<Uuid>,
    /// Failure message, for failed and queued events.
    pub error: Option<String>,
}

/// Result of one reconcile pass over a session key.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Session key that was reconciled.
    pub session_key: String,
    /// Server session, when resolved.
    pub session_id: Option<Uuid>,
    /// One entry per queued event, in client order.
    pub outcomes: Vec<EventReplay>,
    /// Events still queued after the pass.
    pub pending: usize,
}

impl SyncReport {
    /// Number of events that ended in `status`.
    pub fn count(&self, status: ReplayStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    /// User-facing notice while events remain unsynced.
    pub fn pending_message(&self) -> Option<String> {
        (self.pending > 0).then(|| format!("{} events pending sync", self.pending))
    }
}

/// Drives replay of an [`OfflineQueue`] into a [`ReplayTarget`].
pub struct SyncReconciler {
    queue: Arc<dyn OfflineQueue>,
    target: Arc<dyn ReplayTarget>,
    gates: Arc<KeyedGate<String>>,
    max_attempts: u32,
}

impl SyncReconciler {
    /// Reconciler over `queue`, serialized per session key by `gates`.
    pub fn new(
        queue: Arc<dyn OfflineQueue>,
        target: Arc<dyn ReplayTarget>,
        gates: Arc<KeyedGate<String>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            target,
            gates,
            max_attempts,
        }
    }

    /// Replay every unsynced event of `session_key` in client order.
    ///
    /// Each success is checkpointed as soon as the target acknowledges it. A
    /// rejected event is counted and skipped; an unreachable store stops the
    /// pass and leaves the rest queued.
    pub async fn reconcile(&self, session_key: &str) -> Result<SyncReport, ServiceError> {
        let _gate = self.gates.exclusive(&session_key.to_string()).await;

        let pending = self.queue.pending(session_key).await?;
        let mut report = SyncReport {
            session_key: session_key.to_string(),
            session_id: None,
            outcomes: Vec::with_capacity(pending.len()),
            pending: 0,
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let anchor = self.queue.anchor(session_key).await?;
        let resolved = self
            .target
            .resolve_session(session_key.to_string(), anchor)
            .await;
        let session_id = match resolved {
            Ok(session_id) => session_id,
            Err(err) => {
                warn!(session_key, error = %err, "cannot resolve session for queued events");
                for event in &pending {
                    let outcome = self.settle_failure(event, &err).await?;
                    report.outcomes.push(outcome);
                }
                report.pending = self.queue.pending(session_key).await?.len();
                return Ok(report);
            }
        };
        report.session_id = Some(session_id);

        let mut unreachable: Option<ServiceError> = None;
        for event in pending {
            if let Some(err) = &unreachable {
                report.outcomes.push(self.settle_failure(&event, err).await?);
                continue;
            }
            if event.attempts >= self.max_attempts {
                report.outcomes.push(EventReplay {
                    idempotency_key: event.idempotency_key.clone(),
                    client_sequence: event.client_sequence,
                    status: ReplayStatus::Exhausted,
                    event_id: None,
                    error: event.last_error.clone(),
                });
                continue;
            }

            let replayed = self
                .target
                .replay(session_id, event.idempotency_key.clone(), event.draft.clone())
                .await;
            match replayed {
                Ok(outcome) => {
                    self.queue
                        .mark_synced(session_key, &event.idempotency_key)
                        .await?;
                    let (status, event_id) = match outcome {
                        ReplayOutcome::Recorded(id) => (ReplayStatus::Synced, id),
                        ReplayOutcome::Duplicate(id) => (ReplayStatus::Duplicate, id),
                    };
                    debug!(session_key, key = %event.idempotency_key, ?status, "queued event replayed");
                    report.outcomes.push(EventReplay {
                        idempotency_key: event.idempotency_key,
                        client_sequence: event.client_sequence,
                        status,
                        event_id: Some(event_id),
                        error: None,
                    });
                }
                Err(err) => {
                    report.outcomes.push(self.settle_failure(&event, &err).await?);
                    if err.is_transient() {
                        unreachable = Some(err);
                    }
                }
            }
        }

        report.pending = self.queue.pending(session_key).await?.len();
        info!(
            session_key,
            %session_id,
            synced = report.count(ReplayStatus::Synced),
            duplicate = report.count(ReplayStatus::Duplicate),
            failed = report.count(ReplayStatus::Failed),
            pending = report.pending,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Reconcile every session key that still has queued events.
    pub async fn reconcile_all(&self) -> Result<Vec<SyncReport>, ServiceError> {
        let mut reports = Vec::new();
        for session_key in self.queue.session_keys().await? {
            reports.push(self.reconcile(&session_key).await?);
        }
        Ok(reports)
    }

    async fn settle_failure(
        &self,
        event: &QueuedEvent,
        err: &ServiceError,
    ) -> Result<EventReplay, ServiceError> {
        let failure = ServiceError::SyncReplayFailure {
            key: event.idempotency_key.clone(),
            reason: err.to_string(),
        };
        let status = if err.is_transient() {
            ReplayStatus::Queued
        } else {
            warn!(session_key = %event.session_key, error = %failure, "queued event rejected");
            self.queue
                .record_failure(&event.session_key, &event.idempotency_key, failure.to_string())
                .await?;
            ReplayStatus::Failed
        };

        Ok(EventReplay {
            idempotency_key: event.idempotency_key.clone(),
            client_sequence: event.client_sequence,
            status,
            event_id: None,
            error: Some(failure.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::{dao::models::EventType, services::offline_queue::MemoryOfflineQueue};

    /// Target failing chosen keys: `true` for an unreachable store, `false` for a rejection.
    struct ScriptedTarget {
        session_id: Uuid,
        failing: HashMap<String, bool>,
        replayed: Mutex<Vec<String>>,
    }

    impl ScriptedTarget {
        fn new(failing: &[(&str, bool)]) -> Arc<Self> {
            Arc::new(Self {
                session_id: Uuid::new_v4(),
                failing: failing
                    .iter()
                    .map(|(key, transient)| (key.to_string(), *transient))
                    .collect(),
                replayed: Mutex::new(Vec::new()),
            })
        }

        fn replayed(&self) -> Vec<String> {
            self.replayed.lock().unwrap().clone()
        }
    }

    impl ReplayTarget for ScriptedTarget {
        fn resolve_session(
            &self,
            _session_key: String,
            _anchor: Option<SessionAnchor>,
        ) -> BoxFuture<'static, Result<Uuid, ServiceError>> {
            let session_id = self.session_id;
            Box::pin(async move { Ok(session_id) })
        }

        fn replay(
            &self,
            _session_id: Uuid,
            idempotency_key: String,
            _draft: EventDraft,
        ) -> BoxFuture<'static, Result<ReplayOutcome, ServiceError>> {
            self.replayed.lock().unwrap().push(idempotency_key.clone());
            let result = match self.failing.get(&idempotency_key) {
                Some(true) => Err(ServiceError::Timeout),
                Some(false) => Err(ServiceError::PlayerNotFound(99)),
                None => Ok(ReplayOutcome::Recorded(Uuid::new_v4())),
            };
            Box::pin(async move { result })
        }
    }

    fn draft() -> EventDraft {
        EventDraft {
            player_id: Some(7),
            event_type: EventType::FgMade,
            event_value: None,
            quarter: 1,
            game_time: 12,
            is_opponent_event: false,
            opponent_jersey: None,
            rebound_kind: None,
            metadata: None,
        }
    }

    async fn queue_with(keys: &[&str]) -> Arc<MemoryOfflineQueue> {
        let queue = Arc::new(MemoryOfflineQueue::new());
        for key in keys {
            queue.enqueue("s1", key, draft()).await.unwrap();
        }
        queue
    }

    fn reconciler(queue: Arc<MemoryOfflineQueue>, target: Arc<ScriptedTarget>, max: u32) -> SyncReconciler {
        SyncReconciler::new(queue, target, Arc::new(KeyedGate::new()), max)
    }

    #[tokio::test]
    async fn rejected_events_do_not_block_later_ones() {
        let queue = queue_with(&["a", "b", "c"]).await;
        let target = ScriptedTarget::new(&[("b", false)]);
        let report = reconciler(queue.clone(), target.clone(), 3)
            .reconcile("s1")
            .await
            .unwrap();

        assert_eq!(target.replayed(), vec!["a", "b", "c"]);
        let statuses = report.outcomes.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![ReplayStatus::Synced, ReplayStatus::Failed, ReplayStatus::Synced]
        );
        assert_eq!(report.pending, 1);
        assert_eq!(report.pending_message().as_deref(), Some("1 events pending sync"));

        let left = queue.pending("s1").await.unwrap();
        assert_eq!(left[0].idempotency_key, "b");
        assert_eq!(left[0].attempts, 1);
    }

    #[tokio::test]
    async fn unreachable_store_stops_the_pass_without_spending_attempts() {
        let queue = queue_with(&["a", "b", "c"]).await;
        let target = ScriptedTarget::new(&[("b", true)]);
        let report = reconciler(queue.clone(), target.clone(), 3)
            .reconcile("s1")
            .await
            .unwrap();

        assert_eq!(target.replayed(), vec!["a", "b"]);
        assert_eq!(report.count(ReplayStatus::Queued), 2);
        assert!(queue
            .pending("s1")
            .await
            .unwrap()
            .iter()
            .all(|event| event.attempts == 0));
    }

    #[tokio::test]
    async fn exhausted_events_are_not_retried() {
        let queue = queue_with(&["a"]).await;
        let target = ScriptedTarget::new(&[("a", false)]);
        let reconciler = reconciler(queue.clone(), target.clone(), 2);

        reconciler.reconcile("s1").await.unwrap();
        reconciler.reconcile("s1").await.unwrap();
        let third = reconciler.reconcile("s1").await.unwrap();

        assert_eq!(target.replayed().len(), 2);
        assert_eq!(third.outcomes[0].status, ReplayStatus::Exhausted);
        assert_eq!(third.pending_message().as_deref(), Some("1 events pending sync"));
    }

    #[tokio::test]
    async fn empty_queue_reports_nothing() {
        let queue = queue_with(&[]).await;
        let report = reconciler(queue, ScriptedTarget::new(&[]), 3)
            .reconcile("s1")
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(report.session_id, None);
        assert_eq!(report.pending_message(), None);
    }
}
