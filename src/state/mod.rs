mod gate;
mod revisions;
pub mod session_machine;
mod sse;

use std::{future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{RwLock, watch};
use tokio::time::timeout;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{
        collaborators::{GoalCatalog, Roster, StaticGoalCatalog, StaticRoster},
        storage::StorageResult,
        tracking_store::TrackingStore,
    },
    error::ServiceError,
    services::{
        goal_progress::GoalStatus,
        notifier::{Notifier, SseNotifier},
        offline_queue::{MemoryOfflineQueue, OfflineQueue},
        sse_events,
    },
};

pub use self::gate::{GateGuard, KeyedGate};
pub use self::revisions::ScoreRevisions;
pub use self::sse::SseHub;

/// Handle shared by every handler and background task.
pub type SharedState = Arc<AppState>;

const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Central application state: storage handle, collaborators, live feed and gates.
pub struct AppState {
    store: RwLock<Option<Arc<dyn TrackingStore>>>,
    roster: Arc<dyn Roster>,
    goals: Arc<dyn GoalCatalog>,
    notifier: Arc<dyn Notifier>,
    spool: Arc<dyn OfflineQueue>,
    live: SseHub,
    degraded: watch::Sender<bool>,
    session_gates: KeyedGate<Uuid>,
    sync_gates: Arc<KeyedGate<String>>,
    goal_statuses: DashMap<String, GoalStatus>,
    score_revisions: ScoreRevisions,
    config: AppConfig,
}

impl AppState {
    /// Construct a new [`AppState`] with an in-memory sync spool.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        Self::with_spool(config, Arc::new(MemoryOfflineQueue::new()))
    }

    /// Construct a new [`AppState`] spooling degraded-mode sync batches into `spool`.
    pub fn with_spool(config: AppConfig, spool: Arc<dyn OfflineQueue>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let live = SseHub::new(LIVE_CHANNEL_CAPACITY);
        Arc::new(Self {
            store: RwLock::new(None),
            roster: Arc::new(StaticRoster::new(&config.roster)),
            goals: Arc::new(StaticGoalCatalog::new(config.goals.clone())),
            notifier: Arc::new(SseNotifier::new(live.clone())),
            spool,
            live,
            degraded: degraded_tx,
            session_gates: KeyedGate::new(),
            sync_gates: Arc::new(KeyedGate::new()),
            goal_statuses: DashMap::new(),
            score_revisions: ScoreRevisions::default(),
            config,
        })
    }

    /// Obtain a handle to the current tracking store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn TrackingStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Current tracking store, or [`ServiceError::Degraded`] when none is installed.
    pub async fn require_store(&self) -> Result<Arc<dyn TrackingStore>, ServiceError> {
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new tracking store implementation and leave degraded mode.
    pub async fn set_store(&self, store: Arc<dyn TrackingStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Run a store call under the configured timeout.
    pub async fn store_call<T, F>(&self, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Timeout),
        }
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update the degraded flag, broadcasting it on the live feed when it changes.
    pub fn update_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });

        if changed {
            sse_events::broadcast_system_status(self, value);
        }
    }

    /// Broadcast hub used for the live SSE stream.
    pub fn live_sse(&self) -> &SseHub {
        &self.live
    }

    /// Roster collaborator.
    pub fn roster(&self) -> &Arc<dyn Roster> {
        &self.roster
    }

    /// Goal configuration collaborator.
    pub fn goal_catalog(&self) -> &Arc<dyn GoalCatalog> {
        &self.goals
    }

    /// Receiver of goal status changes.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Durable queue holding sync batches received while the store was unreachable.
    pub fn spool(&self) -> &Arc<dyn OfflineQueue> {
        &self.spool
    }

    /// Gates serializing lifecycle transitions and event writes per session.
    pub fn session_gates(&self) -> &KeyedGate<Uuid> {
        &self.session_gates
    }

    /// Gates serializing sync replays per session key.
    pub fn sync_gates(&self) -> Arc<KeyedGate<String>> {
        self.sync_gates.clone()
    }

    /// Last observed status per goal id, used to detect status changes.
    pub fn goal_statuses(&self) -> &DashMap<String, GoalStatus> {
        &self.goal_statuses
    }

    /// Ordering of the live score snapshots broadcast per session.
    pub fn score_revisions(&self) -> &ScoreRevisions {
        &self.score_revisions
    }

    /// Immutable configuration loaded at start-up.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
