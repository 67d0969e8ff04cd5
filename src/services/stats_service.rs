use uuid::Uuid;

use crate::{
    dto::{box_score::BoxScoreResponse, goal::GoalProgressResponse},
    error::ServiceError,
    services::{aggregator, goal_progress, session_registry},
    state::SharedState,
};

/// Recompute the box score of a session from its live events.
pub async fn box_score(
    state: &SharedState,
    session_id: Uuid,
) -> Result<BoxScoreResponse, ServiceError> {
    let session = session_registry::get_session(state, session_id).await?;
    let store = state.require_store().await?;
    let events = state.store_call(store.list_events(session.id, false)).await?;
    let box_score = aggregator::aggregate(&events, !session.is_active);

    Ok(BoxScoreResponse {
        session: session.into(),
        box_score,
    })
}

/// Evaluate every configured goal at a session. Read-only: no notifications are sent.
pub async fn goal_progress(
    state: &SharedState,
    session_id: Uuid,
) -> Result<GoalProgressResponse, ServiceError> {
    let goals = goal_progress::evaluate_session(state, session_id).await?;
    Ok(GoalProgressResponse { session_id, goals })
}
