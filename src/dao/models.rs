use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// One live-tracked occurrence of a scheduled event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    /// Stable identifier for the session.
    pub id: Uuid,
    /// Scheduled event this session tracks.
    pub event_id: i64,
    /// Game record lazily created when the first event is recorded.
    pub derived_game_id: Option<Uuid>,
    /// Client-chosen idempotency anchor, globally unique and never reused.
    pub session_key: String,
    /// Whether the session still accepts events.
    pub is_active: bool,
    /// When tracking started.
    pub started_at: SystemTime,
    /// When tracking was completed, if it was.
    pub ended_at: Option<SystemTime>,
    /// Identity of the user who started tracking.
    pub created_by: String,
    /// Last sequence number handed out to an event of this session.
    pub next_sequence: u64,
}

/// Insert payload for a fresh session; the store assigns identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    /// Scheduled event to track.
    pub event_id: i64,
    /// Client-chosen key, unique across all sessions.
    pub session_key: String,
    /// Identity of the user starting the session.
    pub created_by: String,
}

impl NewSession {
    /// Materialise the row that a store persists for this payload.
    pub fn into_entity(self, id: Uuid, started_at: SystemTime) -> SessionEntity {
        SessionEntity {
            id,
            event_id: self.event_id,
            derived_game_id: None,
            session_key: self.session_key,
            is_active: true,
            started_at,
            ended_at: None,
            created_by: self.created_by,
            next_sequence: 0,
        }
    }
}

/// Closed set of in-game occurrences that can be tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Two-point field goal made.
    FgMade,
    /// Two-point field goal missed.
    FgMissed,
    /// Three-pointer made.
    ThreeMade,
    /// Three-pointer missed.
    ThreeMissed,
    /// Free throw made.
    FtMade,
    /// Free throw missed.
    FtMissed,
    /// Rebound, optionally split by [`ReboundKind`].
    Rebound,
    /// Assist.
    Assist,
    /// Steal.
    Steal,
    /// Block.
    Block,
    /// Turnover.
    Turnover,
    /// Personal foul.
    Foul,
}

impl EventType {
    /// Points credited when no explicit `event_value` override is recorded.
    pub fn default_points(self) -> u32 {
        match self {
            EventType::FgMade => 2,
            EventType::ThreeMade => 3,
            EventType::FtMade => 1,
            _ => 0,
        }
    }

    /// Whether the event scores, which is the only case where a value override is meaningful.
    pub fn is_made_shot(self) -> bool {
        matches!(
            self,
            EventType::FgMade | EventType::ThreeMade | EventType::FtMade
        )
    }
}

/// Explicit rebound split; absent when the recorder did not distinguish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReboundKind {
    /// Rebound of an own missed shot.
    Offensive,
    /// Rebound of an opponent missed shot.
    Defensive,
}

/// One atomic in-game occurrence, append-only apart from the soft-delete marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntity {
    /// Stable identifier for the event.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Monotonic per-session sequence assigned at insert time.
    pub sequence: u64,
    /// Roster player credited with the event; `None` for opponent events.
    pub player_id: Option<i64>,
    /// Kind of occurrence.
    pub event_type: EventType,
    /// Point value override for made shots.
    pub event_value: Option<u32>,
    /// Game period, starting at 1.
    pub quarter: u32,
    /// Elapsed game clock in seconds.
    pub game_time: u32,
    /// Recorded for the opposing team.
    pub is_opponent_event: bool,
    /// Jersey label of the opposing player, when known.
    pub opponent_jersey: Option<String>,
    /// Offensive or defensive split of a rebound.
    pub rebound_kind: Option<ReboundKind>,
    /// Opaque pass-through payload, never interpreted by aggregation.
    pub metadata: Option<Value>,
    /// Client key deduplicating replays of this event.
    pub client_idempotency_key: Option<String>,
    /// When the store accepted the event.
    pub created_at: SystemTime,
    /// Set when the event was retracted; retracted events contribute nothing.
    pub deleted_at: Option<SystemTime>,
}

impl EventEntity {
    /// Whether the event still counts towards aggregates.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Insert payload for a new event; the store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Owning session.
    pub session_id: Uuid,
    /// Roster player credited with the event.
    pub player_id: Option<i64>,
    /// Kind of occurrence.
    pub event_type: EventType,
    /// Point value override for made shots.
    pub event_value: Option<u32>,
    /// Game period, starting at 1.
    pub quarter: u32,
    /// Elapsed game clock in seconds.
    pub game_time: u32,
    /// Recorded for the opposing team.
    pub is_opponent_event: bool,
    /// Jersey label of the opposing player.
    pub opponent_jersey: Option<String>,
    /// Offensive or defensive split of a rebound.
    pub rebound_kind: Option<ReboundKind>,
    /// Opaque pass-through payload.
    pub metadata: Option<Value>,
    /// Client key deduplicating replays of this event.
    pub client_idempotency_key: Option<String>,
}

impl NewEvent {
    /// Materialise the row that a store persists for this payload.
    pub fn into_entity(self, id: Uuid, sequence: u64, created_at: SystemTime) -> EventEntity {
        EventEntity {
            id,
            session_id: self.session_id,
            sequence,
            player_id: self.player_id,
            event_type: self.event_type,
            event_value: self.event_value,
            quarter: self.quarter,
            game_time: self.game_time,
            is_opponent_event: self.is_opponent_event,
            opponent_jersey: self.opponent_jersey,
            rebound_kind: self.rebound_kind,
            metadata: self.metadata,
            client_idempotency_key: self.client_idempotency_key,
            created_at,
            deleted_at: None,
        }
    }
}

/// Roster entry supplied by the roster collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterPlayer {
    /// Roster identifier referenced by events.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Jersey label, if assigned.
    #[serde(default)]
    pub jersey: Option<String>,
}

/// Statistic a goal is measured against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GoalMetric {
    /// Team points.
    Points,
    /// Opponent points.
    PointsAllowed,
    /// Team points minus opponent points.
    PointMargin,
    /// Field goals made over attempted, in percent.
    FieldGoalPct,
    /// Three-pointers made over attempted, in percent.
    ThreePointPct,
    /// Free throws made over attempted, in percent.
    FreeThrowPct,
    /// Team rebounds.
    Rebounds,
    /// Team assists.
    Assists,
    /// Team steals.
    Steals,
    /// Team blocks.
    Blocks,
    /// Team turnovers.
    Turnovers,
    /// Team fouls.
    Fouls,
}

/// Comparison applied between the actual value and the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub enum ComparisonOperator {
    /// Actual must reach the target.
    #[serde(rename = ">=", alias = "gte")]
    AtLeast,
    /// Actual must not exceed the target.
    #[serde(rename = "<=", alias = "lte")]
    AtMost,
    /// Actual must equal the target.
    #[serde(rename = "=", alias = "eq")]
    Exactly,
}

/// Window of games a goal is evaluated over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GoalPeriod {
    /// The evaluated game alone.
    PerGame,
    /// Every completed game of the season.
    SeasonTotal,
    /// Mean over the last five games.
    #[serde(rename = "rolling_5")]
    Rolling5,
    /// Mean over the last ten games.
    #[serde(rename = "rolling_10")]
    Rolling10,
}

impl GoalPeriod {
    /// Number of most recent games in the window, `None` for unbounded windows.
    pub fn window_len(self) -> Option<usize> {
        match self {
            GoalPeriod::PerGame => Some(1),
            GoalPeriod::SeasonTotal => None,
            GoalPeriod::Rolling5 => Some(5),
            GoalPeriod::Rolling10 => Some(10),
        }
    }
}

/// Statistical goal definition supplied by the goal configuration collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalDefinition {
    /// Stable goal identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Statistic the goal measures.
    pub metric: GoalMetric,
    /// Value the metric is compared with.
    pub target_value: f64,
    /// Comparison between actual and target.
    #[serde(rename = "comparison_operator")]
    pub operator: ComparisonOperator,
    /// Games the goal is evaluated over.
    #[serde(rename = "period_type")]
    pub period: GoalPeriod,
    /// Width of the at-risk band; derived from the configured ratio when absent.
    #[serde(default)]
    pub tolerance: Option<f64>,
}
