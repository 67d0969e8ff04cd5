use std::{collections::HashMap, sync::Arc};

use tracing::{info, warn};

use crate::{
    dto::sync::SyncBatchRequest,
    error::ServiceError,
    services::{
        offline_queue::{MemoryOfflineQueue, OfflineQueue},
        sync_reconciler::{
            EventReplay, ReplayStatus, ServiceReplayTarget, SyncReconciler, SyncReport,
        },
    },
    state::SharedState,
};

/// A device uploads each event once per batch; the batch itself is its retry unit.
const BATCH_REPLAY_ATTEMPTS: u32 = 1;

/// Replay a device's offline batch.
///
/// While the store is unreachable the batch is spooled server-side and every
/// event is reported as queued; the spool is drained once storage recovers.
/// Events hit by a store outage mid-batch are spooled the same way.
pub async fn sync_batch(
    state: &SharedState,
    mut request: SyncBatchRequest,
) -> Result<SyncReport, ServiceError> {
    let anchor = request.anchor();
    request.events.sort_by_key(|item| item.client_sequence);
    let client_sequences = request
        .events
        .iter()
        .map(|item| (item.idempotency_key.clone(), item.client_sequence))
        .collect::<HashMap<_, _>>();

    if state.is_degraded() {
        let spool = state.spool();
        spool.register_anchor(anchor.clone()).await?;
        let mut outcomes = Vec::with_capacity(request.events.len());
        for item in request.events {
            spool
                .enqueue(&anchor.session_key, &item.idempotency_key, item.event)
                .await?;
            outcomes.push(EventReplay {
                idempotency_key: item.idempotency_key,
                client_sequence: item.client_sequence,
                status: ReplayStatus::Queued,
                event_id: None,
                error: None,
            });
        }
        let pending = spool.pending(&anchor.session_key).await?.len();
        info!(session_key = %anchor.session_key, pending, "sync batch spooled in degraded mode");
        return Ok(SyncReport {
            session_key: anchor.session_key,
            session_id: None,
            outcomes,
            pending,
        });
    }

    let batch = Arc::new(MemoryOfflineQueue::new());
    batch.register_anchor(anchor.clone()).await?;
    let mut drafts = HashMap::with_capacity(request.events.len());
    for item in request.events {
        batch
            .enqueue(&anchor.session_key, &item.idempotency_key, item.event.clone())
            .await?;
        drafts.entry(item.idempotency_key).or_insert(item.event);
    }

    let reconciler = SyncReconciler::new(
        batch,
        Arc::new(ServiceReplayTarget::new(state.clone())),
        state.sync_gates(),
        BATCH_REPLAY_ATTEMPTS,
    );
    let mut report = reconciler.reconcile(&anchor.session_key).await?;

    let mut spooled = false;
    for outcome in &mut report.outcomes {
        if let Some(sequence) = client_sequences.get(&outcome.idempotency_key) {
            outcome.client_sequence = *sequence;
        }
        if outcome.status != ReplayStatus::Queued {
            continue;
        }
        if let Some(draft) = drafts.remove(&outcome.idempotency_key) {
            if !spooled {
                state.spool().register_anchor(anchor.clone()).await?;
                spooled = true;
            }
            state
                .spool()
                .enqueue(&anchor.session_key, &outcome.idempotency_key, draft)
                .await?;
        }
    }
    if spooled {
        warn!(session_key = %anchor.session_key, "store unreachable during sync; remaining events spooled");
    }

    Ok(report)
}

/// Replay everything spooled while the store was unreachable.
pub async fn drain_spool(state: &SharedState) -> Result<Vec<SyncReport>, ServiceError> {
    let reconciler = SyncReconciler::new(
        state.spool().clone(),
        Arc::new(ServiceReplayTarget::new(state.clone())),
        state.sync_gates(),
        state.config().max_replay_attempts,
    );
    reconciler.reconcile_all().await
}

/// Drain the spool in the background, logging what remains.
pub fn spawn_drain(state: SharedState) {
    tokio::spawn(async move {
        match drain_spool(&state).await {
            Ok(reports) => {
                for report in reports.iter().filter(|report| report.pending > 0) {
                    if let Some(message) = report.pending_message() {
                        warn!(session_key = %report.session_key, "{message}");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to drain the sync spool"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{EventType, RosterPlayer},
            tracking_store::MemoryTrackingStore,
        },
        dto::sync::SyncEventItem,
        services::{ingestor::EventDraft, session_registry},
        state::AppState,
    };

    fn config() -> AppConfig {
        AppConfig {
            roster: vec![RosterPlayer {
                id: 7,
                name: "Bea".into(),
                jersey: Some("7".into()),
            }],
            ..AppConfig::default()
        }
    }

    fn item(key: &str, client_sequence: u64, player_id: i64) -> SyncEventItem {
        SyncEventItem {
            idempotency_key: key.into(),
            client_sequence,
            event: EventDraft {
                player_id: Some(player_id),
                event_type: EventType::ThreeMade,
                event_value: None,
                quarter: 2,
                game_time: 420,
                is_opponent_event: false,
                opponent_jersey: None,
                rebound_kind: None,
                metadata: None,
            },
        }
    }

    fn batch(events: Vec<SyncEventItem>) -> SyncBatchRequest {
        SyncBatchRequest {
            session_key: "tablet-a".into(),
            event_id: 16,
            created_by: "coach".into(),
            owns_session: true,
            events,
        }
    }

    #[tokio::test]
    async fn batch_creates_the_owned_session_and_reports_per_event() {
        let state = AppState::new(config());
        state.set_store(Arc::new(MemoryTrackingStore::new())).await;

        let report = sync_batch(&state, batch(vec![item("b", 2, 99), item("a", 1, 7)]))
            .await
            .unwrap();

        let statuses = report
            .outcomes
            .iter()
            .map(|o| (o.idempotency_key.as_str(), o.client_sequence, o.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![("a", 1, ReplayStatus::Synced), ("b", 2, ReplayStatus::Failed)]
        );
        let session = session_registry::find_session_by_key(&state, "tablet-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.session_id, Some(session.id));
    }

    #[tokio::test]
    async fn degraded_batches_are_spooled_then_drained() {
        let state = AppState::new(config());

        let report = sync_batch(&state, batch(vec![item("abc", 1, 7)])).await.unwrap();
        assert_eq!(report.outcomes[0].status, ReplayStatus::Queued);
        assert_eq!(state.spool().pending_count().await.unwrap(), 1);

        state.set_store(Arc::new(MemoryTrackingStore::new())).await;
        let reports = drain_spool(&state).await.unwrap();
        assert_eq!(reports[0].count(ReplayStatus::Synced), 1);
        assert_eq!(state.spool().pending_count().await.unwrap(), 0);
    }
}
