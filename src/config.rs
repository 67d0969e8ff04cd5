//! Application-level configuration loading, including the roster and goal catalog.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::dao::models::{GoalDefinition, RosterPlayer};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "COURTSIDE_BACK_CONFIG_PATH";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_GOAL_TOLERANCE_RATIO: f64 = 0.1;
const DEFAULT_MAX_REPLAY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Upper bound for every individual store call.
    pub store_timeout: Duration,
    /// Default at-risk band, as a fraction of the goal target.
    pub goal_tolerance_ratio: f64,
    /// Replays of a queued event that fail permanently this many times are left for manual review.
    pub max_replay_attempts: u32,
    /// File backing the degraded-mode sync spool; memory-only when absent.
    pub offline_queue_path: Option<PathBuf>,
    /// Players known to the static roster.
    pub roster: Vec<RosterPlayer>,
    /// Goals evaluated after every completed session.
    pub goals: Vec<GoalDefinition>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        players = app_config.roster.len(),
                        goals = app_config.goals.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document.
    pub fn from_json(contents: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    store_timeout_ms: u64,
    goal_tolerance_ratio: f64,
    max_replay_attempts: u32,
    offline_queue_path: Option<PathBuf>,
    roster: Vec<RosterPlayer>,
    goals: Vec<GoalDefinition>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            goal_tolerance_ratio: DEFAULT_GOAL_TOLERANCE_RATIO,
            max_replay_attempts: DEFAULT_MAX_REPLAY_ATTEMPTS,
            offline_queue_path: None,
            roster: Vec::new(),
            goals: Vec::new(),
        }
    }
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            store_timeout: Duration::from_millis(value.store_timeout_ms.max(1)),
            goal_tolerance_ratio: value.goal_tolerance_ratio.abs(),
            max_replay_attempts: value.max_replay_attempts.max(1),
            offline_queue_path: value.offline_queue_path,
            roster: value.roster,
            goals: value.goals,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{ComparisonOperator, GoalMetric, GoalPeriod};

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.max_replay_attempts, 5);
        assert!(config.roster.is_empty());
        assert!(config.offline_queue_path.is_none());
    }

    #[test]
    fn parses_roster_and_goals() {
        let config = AppConfig::from_json(
            r#"{
                "store_timeout_ms": 250,
                "roster": [{"id": 18, "name": "Ada", "jersey": "18"}],
                "goals": [{
                    "id": "ppg",
                    "name": "Score 60 a game",
                    "metric": "points",
                    "target_value": 60,
                    "comparison_operator": ">=",
                    "period_type": "rolling_5"
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.roster[0].id, 18);
        let goal = &config.goals[0];
        assert_eq!(goal.metric, GoalMetric::Points);
        assert_eq!(goal.operator, ComparisonOperator::AtLeast);
        assert_eq!(goal.period, GoalPeriod::Rolling5);
        assert_eq!(goal.tolerance, None);
    }
}
