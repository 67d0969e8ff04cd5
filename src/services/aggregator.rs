//! Pure fold of a session's event sequence into score and box-score structures.
//!
//! Nothing here is cached or persisted: every read recomputes from the events,
//! so retractions and replays can never leave a stale running total behind.
//! Only ordered collections are used, which makes the serialized output
//! byte-identical across runs for the same input.

use std::collections::BTreeMap;

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dao::{
    models::{EventEntity, EventType, ReboundKind},
    tracking_store::event_order,
};

/// Counting statistics for one side, one player or one (player, quarter) cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct StatLine {
    /// Points scored.
    pub points: u32,
    /// Field goals made, threes included.
    pub fgm: u32,
    /// Field goals attempted, threes included.
    pub fga: u32,
    /// Three-pointers made.
    pub three_pm: u32,
    /// Three-pointers attempted.
    pub three_pa: u32,
    /// Free throws made.
    pub ftm: u32,
    /// Free throws attempted.
    pub fta: u32,
    /// All rebounds.
    pub rebounds: u32,
    /// Rebounds explicitly recorded as offensive.
    pub offensive_rebounds: u32,
    /// Rebounds explicitly recorded as defensive.
    pub defensive_rebounds: u32,
    /// Assists.
    pub assists: u32,
    /// Steals.
    pub steals: u32,
    /// Blocks.
    pub blocks: u32,
    /// Turnovers.
    pub turnovers: u32,
    /// Fouls.
    pub fouls: u32,
}

impl StatLine {
    /// Add the contribution of one event; returns the points it scored.
    pub fn apply(&mut self, event: &EventEntity) -> u32 {
        let points = points_for(event);
        self.points = self.points.saturating_add(points);

        match event.event_type {
            EventType::FgMade => {
                self.fgm += 1;
                self.fga += 1;
            }
            EventType::FgMissed => self.fga += 1,
            EventType::ThreeMade => {
                self.fgm += 1;
                self.fga += 1;
                self.three_pm += 1;
                self.three_pa += 1;
            }
            EventType::ThreeMissed => {
                self.fga += 1;
                self.three_pa += 1;
            }
            EventType::FtMade => {
                self.ftm += 1;
                self.fta += 1;
            }
            EventType::FtMissed => self.fta += 1,
            EventType::Rebound => {
                self.rebounds += 1;
                match event.rebound_kind {
                    Some(ReboundKind::Offensive) => self.offensive_rebounds += 1,
                    Some(ReboundKind::Defensive) => self.defensive_rebounds += 1,
                    None => {}
                }
            }
            EventType::Assist => self.assists += 1,
            EventType::Steal => self.steals += 1,
            EventType::Block => self.blocks += 1,
            EventType::Turnover => self.turnovers += 1,
            EventType::Foul => self.fouls += 1,
        }

        points
    }

    /// Shooting percentages of this line.
    pub fn shooting(&self) -> ShootingSplits {
        ShootingSplits {
            fg_pct: ratio(self.fgm, self.fga),
            three_pct: ratio(self.three_pm, self.three_pa),
            ft_pct: ratio(self.ftm, self.fta),
        }
    }
}

/// Made-over-attempted ratios; absent when nothing was attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
pub struct ShootingSplits {
    /// Field goal ratio.
    pub fg_pct: Option<f64>,
    /// Three-point ratio.
    pub three_pct: Option<f64>,
    /// Free throw ratio.
    pub ft_pct: Option<f64>,
}

/// Points scored by each side in one quarter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct QuarterScore {
    /// Game period.
    pub quarter: u32,
    /// Team points in the period.
    pub team: u32,
    /// Opponent points in the period.
    pub opponent: u32,
}

/// Box-score cell for one player in one quarter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PlayerQuarterLine {
    /// Roster player.
    pub player_id: i64,
    /// Game period.
    pub quarter: u32,
    /// Counting statistics.
    pub stats: StatLine,
}

/// Game totals for one player.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PlayerTotals {
    /// Roster player.
    pub player_id: i64,
    /// Counting statistics.
    pub stats: StatLine,
    /// Shooting ratios.
    pub shooting: ShootingSplits,
}

/// Running score right after a scoring event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ScorePoint {
    /// Scoring event.
    pub event_id: Uuid,
    /// Its sequence.
    pub sequence: u64,
    /// Game period.
    pub quarter: u32,
    /// Elapsed game clock in seconds.
    pub game_time: u32,
    /// Team score after the event.
    pub team: u32,
    /// Opponent score after the event.
    pub opponent: u32,
}

/// Final classification of a completed game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum GameResult {
    /// Win.
    W,
    /// Loss.
    L,
    /// Tie.
    T,
}

/// Everything derived from one session's events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct BoxScore {
    /// Team totals.
    pub team: StatLine,
    /// Opponent totals.
    pub opponent: StatLine,
    /// Team shooting ratios.
    pub team_shooting: ShootingSplits,
    /// Opponent shooting ratios.
    pub opponent_shooting: ShootingSplits,
    /// Points per quarter.
    pub line_score: Vec<QuarterScore>,
    /// Per-player per-quarter cells.
    pub player_quarters: Vec<PlayerQuarterLine>,
    /// Per-player totals.
    pub players: Vec<PlayerTotals>,
    /// Running score after each scoring event.
    pub timeline: Vec<ScorePoint>,
    /// Only present once the session is completed.
    pub result: Option<GameResult>,
    /// Number of live events folded.
    pub events_counted: usize,
}

impl BoxScore {
    /// Team points.
    pub fn team_points(&self) -> u32 {
        self.team.points
    }

    /// Opponent points.
    pub fn opponent_points(&self) -> u32 {
        self.opponent.points
    }
}

/// Points contributed by an event: the recorded override, or the type default.
pub fn points_for(event: &EventEntity) -> u32 {
    if !event.event_type.is_made_shot() {
        return 0;
    }
    event
        .event_value
        .unwrap_or_else(|| event.event_type.default_points())
}

/// Fold the events of one session. Retracted events are skipped; input order does not matter.
pub fn aggregate(events: &[EventEntity], completed: bool) -> BoxScore {
    let mut ordered = events
        .iter()
        .filter(|event| event.is_live())
        .collect::<Vec<_>>();
    ordered.sort_by(|a, b| event_order(a, b));

    let mut team = StatLine::default();
    let mut opponent = StatLine::default();
    let mut quarters: BTreeMap<u32, QuarterScore> = BTreeMap::new();
    let mut cells: BTreeMap<(i64, u32), StatLine> = BTreeMap::new();
    let mut players: BTreeMap<i64, StatLine> = BTreeMap::new();
    let mut timeline = Vec::new();

    for event in &ordered {
        let quarter = quarters
            .entry(event.quarter)
            .or_insert_with(|| QuarterScore {
                quarter: event.quarter,
                ..QuarterScore::default()
            });

        let points = if event.is_opponent_event {
            let points = opponent.apply(event);
            quarter.opponent = quarter.opponent.saturating_add(points);
            points
        } else {
            let points = team.apply(event);
            quarter.team = quarter.team.saturating_add(points);
            if let Some(player_id) = event.player_id {
                cells
                    .entry((player_id, event.quarter))
                    .or_default()
                    .apply(event);
                players.entry(player_id).or_default().apply(event);
            }
            points
        };

        if points > 0 {
            timeline.push(ScorePoint {
                event_id: event.id,
                sequence: event.sequence,
                quarter: event.quarter,
                game_time: event.game_time,
                team: team.points,
                opponent: opponent.points,
            });
        }
    }

    let result = completed.then(|| match team.points.cmp(&opponent.points) {
        std::cmp::Ordering::Greater => GameResult::W,
        std::cmp::Ordering::Less => GameResult::L,
        std::cmp::Ordering::Equal => GameResult::T,
    });

    BoxScore {
        team_shooting: team.shooting(),
        opponent_shooting: opponent.shooting(),
        team,
        opponent,
        line_score: quarters.into_values().collect(),
        player_quarters: cells
            .into_iter()
            .map(|((player_id, quarter), stats)| PlayerQuarterLine {
                player_id,
                quarter,
                stats,
            })
            .collect(),
        players: players
            .into_iter()
            .map(|(player_id, stats)| PlayerTotals {
                player_id,
                shooting: stats.shooting(),
                stats,
            })
            .collect(),
        timeline,
        result,
        events_counted: ordered.len(),
    }
}

fn ratio(made: u32, attempted: u32) -> Option<f64> {
    (attempted > 0).then(|| f64::from(made) / f64::from(attempted))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    pub(crate) fn event(sequence: u64, event_type: EventType) -> EventEntity {
        EventEntity {
            id: Uuid::from_u128(u128::from(sequence)),
            session_id: Uuid::nil(),
            sequence,
            player_id: Some(18),
            event_type,
            event_value: None,
            quarter: 1,
            game_time: 0,
            is_opponent_event: false,
            opponent_jersey: None,
            rebound_kind: None,
            metadata: None,
            client_idempotency_key: None,
            created_at: SystemTime::UNIX_EPOCH + Duration::from_secs(sequence),
            deleted_at: None,
        }
    }

    pub(crate) fn opponent(sequence: u64, event_type: EventType) -> EventEntity {
        EventEntity {
            player_id: None,
            is_opponent_event: true,
            opponent_jersey: Some("4".into()),
            ..event(sequence, event_type)
        }
    }

    #[test]
    fn point_table_defaults_and_overrides() {
        let mut override_three = event(3, EventType::ThreeMade);
        override_three.event_value = Some(4);
        let events = vec![
            event(1, EventType::FgMade),
            event(2, EventType::FtMade),
            override_three,
            event(4, EventType::ThreeMissed),
            event(5, EventType::FtMissed),
        ];

        let score = aggregate(&events, false);
        assert_eq!(score.team.points, 2 + 1 + 4);
        assert_eq!((score.team.fgm, score.team.fga), (2, 3));
        assert_eq!((score.team.three_pm, score.team.three_pa), (1, 2));
        assert_eq!((score.team.ftm, score.team.fta), (1, 2));
        assert_eq!(score.team_shooting.ft_pct, Some(0.5));
        assert_eq!(score.opponent_shooting.fg_pct, None);
    }

    #[test]
    fn stored_overrides_never_overflow_the_fold() {
        let mut first = opponent(1, EventType::FgMade);
        first.event_value = Some(u32::MAX);
        let mut second = opponent(2, EventType::FgMade);
        second.event_value = Some(u32::MAX);

        let score = aggregate(&[first, second], true);
        assert_eq!(score.opponent_points(), u32::MAX);
        assert_eq!(score.line_score[0].opponent, u32::MAX);
        assert_eq!(score.result, Some(GameResult::L));
    }

    #[test]
    fn counters_and_rebound_split() {
        let mut offensive = event(1, EventType::Rebound);
        offensive.rebound_kind = Some(ReboundKind::Offensive);
        let events = vec![
            offensive,
            event(2, EventType::Rebound),
            event(3, EventType::Assist),
            event(4, EventType::Steal),
            event(5, EventType::Block),
            event(6, EventType::Turnover),
            event(7, EventType::Foul),
        ];

        let team = aggregate(&events, false).team;
        assert_eq!(team.points, 0);
        assert_eq!(team.rebounds, 2);
        assert_eq!(team.offensive_rebounds, 1);
        assert_eq!(team.defensive_rebounds, 0);
        assert_eq!(
            (team.assists, team.steals, team.blocks, team.turnovers, team.fouls),
            (1, 1, 1, 1, 1)
        );
    }

    #[test]
    fn opponent_events_never_create_player_rows() {
        let events = vec![event(1, EventType::FgMade), opponent(2, EventType::FgMade)];

        let score = aggregate(&events, false);
        assert_eq!(score.team_points(), 2);
        assert_eq!(score.opponent_points(), 2);
        assert_eq!(score.players.len(), 1);
        assert_eq!(score.players[0].player_id, 18);
        assert_eq!(score.player_quarters.len(), 1);
        assert_eq!(score.player_quarters[0].stats.fgm, 1);
        assert_eq!(score.player_quarters[0].stats.fga, 1);
    }

    #[test]
    fn retracted_events_contribute_nothing() {
        let mut retracted = opponent(2, EventType::ThreeMade);
        retracted.deleted_at = Some(SystemTime::now());
        let events = vec![event(1, EventType::FgMade), retracted];

        let score = aggregate(&events, false);
        assert_eq!(score.opponent, StatLine::default());
        assert_eq!(score.team_points(), 2);
        assert_eq!(score.events_counted, 1);
    }

    #[test]
    fn result_only_once_completed() {
        let events = vec![event(1, EventType::FgMade), opponent(2, EventType::FgMade)];
        assert_eq!(aggregate(&events, false).result, None);
        assert_eq!(aggregate(&events, true).result, Some(GameResult::T));

        let events = vec![event(1, EventType::FtMade)];
        assert_eq!(aggregate(&events, true).result, Some(GameResult::W));
        assert_eq!(aggregate(&[], true).result, Some(GameResult::T));
    }

    #[test]
    fn timeline_and_line_score_follow_event_order() {
        let mut late = event(3, EventType::FgMade);
        late.quarter = 2;
        let events = vec![
            late,
            opponent(2, EventType::ThreeMade),
            event(1, EventType::FgMade),
        ];

        let score = aggregate(&events, false);
        let running = score
            .timeline
            .iter()
            .map(|point| (point.team, point.opponent))
            .collect::<Vec<_>>();
        assert_eq!(running, vec![(2, 0), (2, 3), (4, 3)]);
        assert_eq!(
            score.line_score,
            vec![
                QuarterScore {
                    quarter: 1,
                    team: 2,
                    opponent: 3
                },
                QuarterScore {
                    quarter: 2,
                    team: 2,
                    opponent: 0
                },
            ]
        );
    }

    #[test]
    fn output_is_deterministic() {
        let events = vec![
            event(2, EventType::ThreeMade),
            opponent(1, EventType::FgMade),
            event(3, EventType::Rebound),
        ];
        let mut shuffled = events.clone();
        shuffled.reverse();

        let first = serde_json::to_string(&aggregate(&events, true)).unwrap();
        let second = serde_json::to_string(&aggregate(&shuffled, true)).unwrap();
        assert_eq!(first, second);
    }
}
