use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::goal_progress::GoalProgress;

/// Progress of every configured goal, evaluated at one session.
#[derive(Debug, Serialize, ToSchema)]
pub struct GoalProgressResponse {
    /// Session the goals were evaluated at.
    pub session_id: Uuid,
    /// One entry per configured goal.
    pub goals: Vec<GoalProgress>,
}
