use serde::Serialize;
use utoipa::ToSchema;

use crate::{dto::session::SessionSummary, services::aggregator::BoxScore};

/// Aggregated statistics of a session, recomputed from its events on every request.
#[derive(Debug, Serialize, ToSchema)]
pub struct BoxScoreResponse {
    /// Session the score belongs to.
    pub session: SessionSummary,
    /// Aggregated statistics.
    pub box_score: BoxScore,
}
