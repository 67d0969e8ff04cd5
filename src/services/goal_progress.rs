use std::{collections::HashMap, iter};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{ComparisonOperator, GoalDefinition, GoalMetric, GoalPeriod, SessionEntity},
    error::ServiceError,
    services::{
        aggregator::{BoxScore, aggregate},
        session_registry,
    },
    state::{AppState, SharedState},
};

/// Slack under which an `=` goal counts as met.
const EXACT_EPSILON: f64 = 1e-9;

/// Classification of a goal against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Target met.
    OnTrack,
    /// Missed by no more than the tolerance.
    AtRisk,
    /// Missed by more than the tolerance.
    OffTrack,
}

/// Snapshot of one goal evaluated at one session.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GoalProgress {
    /// Goal identifier.
    pub goal_id: String,
    /// Goal name.
    pub name: String,
    /// Measured statistic.
    pub metric: GoalMetric,
    /// Comparison with the target.
    pub operator: ComparisonOperator,
    /// Evaluation window.
    pub period: GoalPeriod,
    /// Target value.
    pub target_value: f64,
    /// `None` when the window holds no data for the metric (e.g. no attempts).
    pub actual_value: Option<f64>,
    /// Actual minus target.
    pub delta: Option<f64>,
    /// Width of the at-risk band.
    pub tolerance: f64,
    /// Classification, absent without data.
    pub status: Option<GoalStatus>,
    /// Number of games in the evaluation window.
    pub games: usize,
}

/// Signal sent to the notifier when a goal changes status.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GoalStatusChange {
    /// Goal identifier.
    pub goal_id: String,
    /// Goal name.
    pub goal_name: String,
    /// Session whose completion triggered the evaluation.
    pub session_id: Uuid,
    /// Status before the evaluation.
    pub previous: GoalStatus,
    /// Status after the evaluation.
    pub current: GoalStatus,
    /// Value that produced the new status.
    pub actual_value: Option<f64>,
    /// Target value.
    pub target_value: f64,
}

enum Sample {
    Count(f64),
    Ratio { made: u32, attempted: u32 },
}

impl Sample {
    fn value(&self) -> Option<f64> {
        match *self {
            Sample::Count(value) => Some(value),
            Sample::Ratio { made, attempted } => percentage(made, attempted),
        }
    }
}

fn sample(score: &BoxScore, metric: GoalMetric) -> Sample {
    let team = &score.team;
    let count = |value: u32| Sample::Count(f64::from(value));
    match metric {
        GoalMetric::Points => count(team.points),
        GoalMetric::PointsAllowed => count(score.opponent.points),
        GoalMetric::PointMargin => {
            Sample::Count(f64::from(team.points) - f64::from(score.opponent.points))
        }
        GoalMetric::FieldGoalPct => Sample::Ratio {
            made: team.fgm,
            attempted: team.fga,
        },
        GoalMetric::ThreePointPct => Sample::Ratio {
            made: team.three_pm,
            attempted: team.three_pa,
        },
        GoalMetric::FreeThrowPct => Sample::Ratio {
            made: team.ftm,
            attempted: team.fta,
        },
        GoalMetric::Rebounds => count(team.rebounds),
        GoalMetric::Assists => count(team.assists),
        GoalMetric::Steals => count(team.steals),
        GoalMetric::Blocks => count(team.blocks),
        GoalMetric::Turnovers => count(team.turnovers),
        GoalMetric::Fouls => count(team.fouls),
    }
}

/// Percentages are expressed on a 0-100 scale.
fn percentage(made: u32, attempted: u32) -> Option<f64> {
    (attempted > 0).then(|| f64::from(made) * 100.0 / f64::from(attempted))
}

/// Value of `metric` over `window`, ordered oldest first with the evaluated game last.
pub fn actual_value(metric: GoalMetric, period: GoalPeriod, window: &[&BoxScore]) -> Option<f64> {
    match period {
        GoalPeriod::PerGame => window.last().and_then(|score| sample(score, metric).value()),
        GoalPeriod::SeasonTotal => {
            let mut total = 0.0;
            let (mut made, mut attempted) = (0u32, 0u32);
            let mut pooled = false;
            for score in window {
                match sample(score, metric) {
                    Sample::Count(value) => total += value,
                    Sample::Ratio {
                        made: m,
                        attempted: a,
                    } => {
                        pooled = true;
                        made += m;
                        attempted += a;
                    }
                }
            }
            if pooled {
                percentage(made, attempted)
            } else {
                (!window.is_empty()).then_some(total)
            }
        }
        GoalPeriod::Rolling5 | GoalPeriod::Rolling10 => {
            let values = window
                .iter()
                .filter_map(|score| sample(score, metric).value())
                .collect::<Vec<_>>();
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Classify `actual` against `target`.
pub fn classify(
    actual: f64,
    target: f64,
    operator: ComparisonOperator,
    tolerance: f64,
) -> GoalStatus {
    let delta = actual - target;
    let holds = match operator {
        ComparisonOperator::AtLeast => delta >= 0.0,
        ComparisonOperator::AtMost => delta <= 0.0,
        ComparisonOperator::Exactly => delta.abs() <= EXACT_EPSILON,
    };

    if holds {
        GoalStatus::OnTrack
    } else if delta.abs() <= tolerance {
        GoalStatus::AtRisk
    } else {
        GoalStatus::OffTrack
    }
}

/// Evaluate one goal over a pre-selected window.
pub fn evaluate_goal(
    goal: &GoalDefinition,
    window: &[&BoxScore],
    tolerance_ratio: f64,
) -> GoalProgress {
    let tolerance = goal
        .tolerance
        .unwrap_or(tolerance_ratio * goal.target_value.abs())
        .abs();
    let actual = actual_value(goal.metric, goal.period, window);

    GoalProgress {
        goal_id: goal.id.clone(),
        name: goal.name.clone(),
        metric: goal.metric,
        operator: goal.operator,
        period: goal.period,
        target_value: goal.target_value,
        actual_value: actual,
        delta: actual.map(|value| value - goal.target_value),
        tolerance,
        status: actual.map(|value| classify(value, goal.target_value, goal.operator, tolerance)),
        games: window.len(),
    }
}

/// Evaluate every configured goal at the given session.
///
/// Rolling windows end at the evaluated session and only reach back to
/// completed sessions that started before it; season totals cover every
/// completed session.
pub async fn evaluate_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<Vec<GoalProgress>, ServiceError> {
    let goals = state.store_call(state.goal_catalog().goals()).await?;
    let session = session_registry::get_session(state, session_id).await?;
    if goals.is_empty() {
        return Ok(Vec::new());
    }

    let store = state.require_store().await?;
    let events = state.store_call(store.list_events(session.id, false)).await?;
    let current = aggregate(&events, !session.is_active);

    let completed = state
        .store_call(store.list_completed_sessions())
        .await?
        .into_iter()
        .filter(|other| other.id != session.id)
        .collect::<Vec<_>>();
    let preceding = completed
        .iter()
        .filter(|other| other.started_at <= session.started_at)
        .collect::<Vec<_>>();

    let needs_season = goals
        .iter()
        .any(|goal| goal.period == GoalPeriod::SeasonTotal);
    let longest = goals
        .iter()
        .filter_map(|goal| goal.period.window_len())
        .max()
        .unwrap_or(1);

    let to_load: Vec<&SessionEntity> = if needs_season {
        completed.iter().collect()
    } else {
        tail(&preceding, longest - 1).to_vec()
    };

    let mut scores = HashMap::with_capacity(to_load.len());
    for other in to_load {
        let events = state.store_call(store.list_events(other.id, false)).await?;
        scores.insert(other.id, aggregate(&events, true));
    }

    let ratio = state.config().goal_tolerance_ratio;
    let progress = goals
        .iter()
        .map(|goal| {
            let history: Vec<&SessionEntity> = match goal.period.window_len() {
                None => completed.iter().collect(),
                Some(len) => tail(&preceding, len - 1).to_vec(),
            };
            let window = history
                .iter()
                .filter_map(|other| scores.get(&other.id))
                .chain(iter::once(&current))
                .collect::<Vec<_>>();
            evaluate_goal(goal, &window, ratio)
        })
        .collect();

    Ok(progress)
}

fn tail<'a, T>(items: &'a [T], len: usize) -> &'a [T] {
    &items[items.len().saturating_sub(len)..]
}

/// Recompute every goal in the background after a session completed.
pub fn spawn_recompute(state: SharedState, session_id: Uuid) {
    tokio::spawn(async move {
        match evaluate_session(&state, session_id).await {
            Ok(progress) => publish_changes(&state, session_id, &progress),
            Err(err) => warn!(%session_id, error = %err, "goal recomputation failed"),
        }
    });
}

fn publish_changes(state: &AppState, session_id: Uuid, progress: &[GoalProgress]) {
    for goal in progress {
        let Some(status) = goal.status else {
            continue;
        };
        match record_status(state.goal_statuses(), &goal.goal_id, status) {
            Some(previous) => state.notifier().notify(GoalStatusChange {
                goal_id: goal.goal_id.clone(),
                goal_name: goal.name.clone(),
                session_id,
                previous,
                current: status,
                actual_value: goal.actual_value,
                target_value: goal.target_value,
            }),
            None => debug!(goal_id = %goal.goal_id, ?status, "goal status unchanged"),
        }
    }
}

/// Store `status` as the latest observation; returns the previous one when it differs.
fn record_status(
    statuses: &DashMap<String, GoalStatus>,
    goal_id: &str,
    status: GoalStatus,
) -> Option<GoalStatus> {
    match statuses.insert(goal_id.to_string(), status) {
        Some(previous) if previous != status => Some(previous),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{models::{EventType, NewSession}, tracking_store::MemoryTrackingStore},
        services::{aggregator::StatLine, ingestor},
        state::AppState,
    };

    fn game(points: u32, allowed: u32) -> BoxScore {
        BoxScore {
            team: StatLine {
                points,
                ..StatLine::default()
            },
            opponent: StatLine {
                points: allowed,
                ..StatLine::default()
            },
            ..BoxScore::default()
        }
    }

    fn shooting(fgm: u32, fga: u32) -> BoxScore {
        BoxScore {
            team: StatLine {
                fgm,
                fga,
                ..StatLine::default()
            },
            ..BoxScore::default()
        }
    }

    fn goal(metric: GoalMetric, period: GoalPeriod, operator: ComparisonOperator) -> GoalDefinition {
        GoalDefinition {
            id: "goal".into(),
            name: "Goal".into(),
            metric,
            target_value: 60.0,
            operator,
            period,
            tolerance: None,
        }
    }

    #[test]
    fn classification_bands() {
        use ComparisonOperator::*;
        assert_eq!(classify(62.0, 60.0, AtLeast, 6.0), GoalStatus::OnTrack);
        assert_eq!(classify(55.0, 60.0, AtLeast, 6.0), GoalStatus::AtRisk);
        assert_eq!(classify(50.0, 60.0, AtLeast, 6.0), GoalStatus::OffTrack);
        assert_eq!(classify(58.0, 60.0, AtMost, 6.0), GoalStatus::OnTrack);
        assert_eq!(classify(64.0, 60.0, AtMost, 6.0), GoalStatus::AtRisk);
        assert_eq!(classify(60.0, 60.0, Exactly, 0.0), GoalStatus::OnTrack);
        assert_eq!(classify(61.0, 60.0, Exactly, 2.0), GoalStatus::AtRisk);
    }

    #[test]
    fn per_game_uses_the_evaluated_game_only() {
        let (old, current) = (game(80, 50), game(40, 50));
        let progress = evaluate_goal(
            &goal(GoalMetric::Points, GoalPeriod::PerGame, ComparisonOperator::AtLeast),
            &[&old, &current],
            0.1,
        );
        assert_eq!(progress.actual_value, Some(40.0));
        assert_eq!(progress.delta, Some(-20.0));
        assert_eq!(progress.tolerance, 6.0);
        assert_eq!(progress.status, Some(GoalStatus::OffTrack));
    }

    #[test]
    fn rolling_window_averages_games() {
        let games = [game(50, 0), game(60, 0), game(64, 0)];
        let window = games.iter().collect::<Vec<_>>();
        let actual = actual_value(GoalMetric::Points, GoalPeriod::Rolling5, &window);
        assert_eq!(actual, Some(58.0));
    }

    #[test]
    fn season_totals_sum_counts_and_pool_percentages() {
        let games = [game(50, 40), game(60, 70)];
        let window = games.iter().collect::<Vec<_>>();
        assert_eq!(
            actual_value(GoalMetric::PointMargin, GoalPeriod::SeasonTotal, &window),
            Some(0.0)
        );

        let games = [shooting(1, 2), shooting(3, 8)];
        let window = games.iter().collect::<Vec<_>>();
        assert_eq!(
            actual_value(GoalMetric::FieldGoalPct, GoalPeriod::SeasonTotal, &window),
            Some(40.0)
        );
        // Averaging the per-game ratios would give 43.75 instead.
        assert_eq!(
            actual_value(GoalMetric::FieldGoalPct, GoalPeriod::Rolling5, &window),
            Some(43.75)
        );
    }

    #[test]
    fn percentages_without_attempts_have_no_status() {
        let empty = BoxScore::default();
        let progress = evaluate_goal(
            &goal(GoalMetric::FreeThrowPct, GoalPeriod::PerGame, ComparisonOperator::AtLeast),
            &[&empty],
            0.1,
        );
        assert_eq!(progress.actual_value, None);
        assert_eq!(progress.status, None);
    }

    #[test]
    fn explicit_tolerance_overrides_ratio() {
        let mut definition =
            goal(GoalMetric::Points, GoalPeriod::PerGame, ComparisonOperator::AtLeast);
        definition.tolerance = Some(25.0);
        let current = game(40, 0);
        let progress = evaluate_goal(&definition, &[&current], 0.1);
        assert_eq!(progress.status, Some(GoalStatus::AtRisk));
    }

    /// Seven completed games; the opponent scores `2 * n` points in game `n`.
    async fn season_of_seven(goals: Vec<GoalDefinition>) -> (SharedState, Vec<Uuid>) {
        let state = AppState::new(AppConfig {
            goals,
            ..AppConfig::default()
        });
        state.set_store(Arc::new(MemoryTrackingStore::new())).await;

        let mut sessions = Vec::new();
        for game in 1..=7i64 {
            let session = session_registry::start_session(
                &state,
                NewSession {
                    event_id: game,
                    session_key: format!("game-{game}"),
                    created_by: "coach".into(),
                },
            )
            .await
            .unwrap()
            .into_session();
            for _ in 0..game {
                let basket = ingestor::tests::draft(None, EventType::FgMade);
                ingestor::record_event(&state, session.id, basket, None)
                    .await
                    .unwrap();
            }
            session_registry::complete_session(&state, session.id)
                .await
                .unwrap();
            sessions.push(session.id);
        }
        (state, sessions)
    }

    fn allowed(period: GoalPeriod) -> GoalDefinition {
        GoalDefinition {
            id: format!("{period:?}"),
            ..goal(GoalMetric::PointsAllowed, period, ComparisonOperator::AtMost)
        }
    }

    #[tokio::test]
    async fn windows_are_selected_from_completed_sessions() {
        let (state, sessions) = season_of_seven(vec![
            allowed(GoalPeriod::Rolling5),
            allowed(GoalPeriod::SeasonTotal),
        ])
        .await;

        let last = evaluate_session(&state, sessions[6]).await.unwrap();
        assert_eq!(last[0].games, 5);
        assert_eq!(last[0].actual_value, Some((6.0 + 8.0 + 10.0 + 12.0 + 14.0) / 5.0));
        assert_eq!(last[1].games, 7);
        assert_eq!(last[1].actual_value, Some(56.0));
    }

    #[tokio::test]
    async fn rolling_windows_ignore_later_sessions() {
        let (state, sessions) = season_of_seven(vec![
            allowed(GoalPeriod::Rolling5),
            allowed(GoalPeriod::SeasonTotal),
        ])
        .await;

        let fourth = evaluate_session(&state, sessions[3]).await.unwrap();
        assert_eq!(fourth[0].games, 4);
        assert_eq!(fourth[0].actual_value, Some((2.0 + 4.0 + 6.0 + 8.0) / 4.0));
        // Season totals cover every completed session, later ones included.
        assert_eq!(fourth[1].games, 7);
        assert_eq!(fourth[1].actual_value, Some(56.0));
    }

    #[test]
    fn status_changes_are_reported_once() {
        let statuses = DashMap::new();
        assert_eq!(record_status(&statuses, "ppg", GoalStatus::OnTrack), None);
        assert_eq!(record_status(&statuses, "ppg", GoalStatus::OnTrack), None);
        assert_eq!(
            record_status(&statuses, "ppg", GoalStatus::OffTrack),
            Some(GoalStatus::OnTrack)
        );
    }
}
