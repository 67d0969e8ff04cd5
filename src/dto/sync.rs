use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dto::validation::{validate_client_key, validate_jersey},
    services::{
        ingestor::EventDraft,
        offline_queue::SessionAnchor,
        sync_reconciler::{EventReplay, ReplayStatus, SyncReport},
    },
};

const MAX_BATCH_SIZE: usize = 500;

/// Events a device queued offline for one session, uploaded on reconnect.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncBatchRequest {
    /// Session key the device used when it started or joined tracking.
    pub session_key: String,
    /// Scheduled event the session tracks.
    pub event_id: i64,
    /// User who recorded the events.
    pub created_by: String,
    /// The device started the session itself while offline and may create it on the server.
    #[serde(default)]
    pub owns_session: bool,
    /// Queued events, in any order.
    pub events: Vec<SyncEventItem>,
}

/// One queued event of a sync batch.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncEventItem {
    /// Client key deduplicating the replay.
    pub idempotency_key: String,
    /// Order in which the device recorded the event; replay follows it.
    pub client_sequence: u64,
    /// Event payload.
    pub event: EventDraft,
}

impl SyncBatchRequest {
    /// Anchor describing the batch's session.
    pub fn anchor(&self) -> SessionAnchor {
        SessionAnchor {
            session_key: self.session_key.clone(),
            event_id: self.event_id,
            created_by: self.created_by.trim().to_string(),
            owns_session: self.owns_session,
        }
    }
}

impl Validate for SyncBatchRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_client_key(&self.session_key) {
            errors.add("session_key", e);
        }
        if self.created_by.trim().is_empty() {
            let mut err = ValidationError::new("created_by_required");
            err.message = Some("created_by must not be empty".into());
            errors.add("created_by", err);
        }
        if self.events.len() > MAX_BATCH_SIZE {
            let mut err = ValidationError::new("batch_too_large");
            err.message = Some(
                format!(
                    "A sync batch holds at most {MAX_BATCH_SIZE} events (got {})",
                    self.events.len()
                )
                .into(),
            );
            errors.add("events", err);
        }
        for item in &self.events {
            if let Err(e) = validate_client_key(&item.idempotency_key) {
                errors.add("events", e);
            }
            if let Some(ref jersey) = item.event.opponent_jersey {
                if let Err(e) = validate_jersey(jersey) {
                    errors.add("events", e);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Per-event outcome of a sync batch.
#[derive(Debug, Serialize, ToSchema)]
pub struct SyncBatchResponse {
    /// Session key the batch was sent for.
    pub session_key: String,
    /// Server-side session the events were replayed into, when it could be resolved.
    pub session_id: Option<Uuid>,
    /// Events recorded by this batch.
    pub synced: usize,
    /// Events that had already been recorded.
    pub duplicates: usize,
    /// Events rejected, including those out of attempts.
    pub failed: usize,
    /// Events not yet recorded, kept for a later pass.
    pub pending: usize,
    /// Notice for the user while events remain unsynced, e.g. "3 events pending sync".
    pub message: Option<String>,
    /// One outcome per event, in replay order.
    pub outcomes: Vec<EventReplay>,
}

impl From<SyncReport> for SyncBatchResponse {
    fn from(report: SyncReport) -> Self {
        Self {
            synced: report.count(ReplayStatus::Synced),
            duplicates: report.count(ReplayStatus::Duplicate),
            failed: report.count(ReplayStatus::Failed) + report.count(ReplayStatus::Exhausted),
            message: report.pending_message(),
            pending: report.pending,
            session_key: report.session_key,
            session_id: report.session_id,
            outcomes: report.outcomes,
        }
    }
}
