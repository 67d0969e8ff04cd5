use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{services::aggregator::QuarterScore, state::session_machine::SessionPhase};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name.
    pub event: Option<String>,
    /// JSON payload.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Identifier of the SSE stream.
    pub stream: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Whether the backend is running without a storage backend connection.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the backend enters or leaves degraded mode.
pub struct SystemStatus {
    /// Whether storage is unreachable.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Recomputed score, broadcast after every recorded or retracted event.
pub struct ScoreUpdateEvent {
    /// Session whose score changed.
    pub session_id: Uuid,
    /// Increases with every snapshot of the same session; older snapshots are never sent after newer ones.
    pub revision: u64,
    /// Team points.
    pub team_points: u32,
    /// Opponent points.
    pub opponent_points: u32,
    /// Points per quarter.
    pub line_score: Vec<QuarterScore>,
    /// Number of live events behind this score.
    pub events_counted: usize,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when a session starts or completes.
pub struct SessionLifecycleEvent {
    /// Session that changed phase.
    pub session_id: Uuid,
    /// Tracked scheduled event.
    pub event_id: i64,
    /// New phase.
    pub phase: SessionPhase,
}
