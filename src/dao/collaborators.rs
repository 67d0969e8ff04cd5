use std::{collections::HashSet, sync::Arc};

use futures::future::BoxFuture;

use crate::dao::{
    models::{GoalDefinition, RosterPlayer},
    storage::StorageResult,
};

/// Roster lookups used to validate own-team events.
pub trait Roster: Send + Sync {
    /// Whether `player_id` belongs to the team roster.
    fn player_exists(&self, player_id: i64) -> BoxFuture<'static, StorageResult<bool>>;
}

/// Source of the statistical goals evaluated after each game.
pub trait GoalCatalog: Send + Sync {
    /// Every configured goal.
    fn goals(&self) -> BoxFuture<'static, StorageResult<Vec<GoalDefinition>>>;
}

/// Roster backed by the player list shipped in the application configuration.
#[derive(Clone, Default)]
pub struct StaticRoster {
    players: Arc<HashSet<i64>>,
}

impl StaticRoster {
    /// Roster over the given players.
    pub fn new(players: &[RosterPlayer]) -> Self {
        Self {
            players: Arc::new(players.iter().map(|player| player.id).collect()),
        }
    }
}

impl Roster for StaticRoster {
    fn player_exists(&self, player_id: i64) -> BoxFuture<'static, StorageResult<bool>> {
        let players = self.players.clone();
        Box::pin(async move { Ok(players.contains(&player_id)) })
    }
}

/// Goal catalog backed by the goal list shipped in the application configuration.
#[derive(Clone, Default)]
pub struct StaticGoalCatalog {
    goals: Arc<Vec<GoalDefinition>>,
}

impl StaticGoalCatalog {
    /// Catalog over the given goals.
    pub fn new(goals: Vec<GoalDefinition>) -> Self {
        Self {
            goals: Arc::new(goals),
        }
    }
}

impl GoalCatalog for StaticGoalCatalog {
    fn goals(&self) -> BoxFuture<'static, StorageResult<Vec<GoalDefinition>>> {
        let goals = self.goals.clone();
        Box::pin(async move { Ok(goals.as_ref().clone()) })
    }
}
