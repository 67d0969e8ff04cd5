use axum::{Json, Router, extract::State, routing::post};
use axum_valid::Valid;

use crate::{
    dto::sync::{SyncBatchRequest, SyncBatchResponse},
    error::AppError,
    services::sync_service,
    state::SharedState,
};

/// Offline sync endpoint.
pub fn router() -> Router<SharedState> {
    Router::new().route("/sync", post(sync_batch))
}

/// Replay a batch of events a device queued while offline.
///
/// Events are replayed in client order; each carries its own idempotency key,
/// so uploading the same batch twice records every event once.
#[utoipa::path(
    post,
    path = "/sync",
    tag = "sync",
    request_body = SyncBatchRequest,
    responses(
        (status = 200, description = "Per-event replay outcomes", body = SyncBatchResponse),
        (status = 400, description = "Malformed batch")
    )
)]
pub async fn sync_batch(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<SyncBatchRequest>>,
) -> Result<Json<SyncBatchResponse>, AppError> {
    let report = sync_service::sync_batch(&state, payload).await?;
    Ok(Json(report.into()))
}
