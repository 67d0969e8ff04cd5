use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        box_score::BoxScoreResponse,
        goal::GoalProgressResponse,
        session::{
            CompleteSessionResponse, SessionSummary, StartOutcomeKind, StartSessionRequest,
            StartSessionResponse,
        },
    },
    error::AppError,
    services::{session_registry, stats_service},
    state::SharedState,
};

/// Session lifecycle and per-session statistics endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/complete", post(complete_session))
        .route("/sessions/by-key/{key}", get(get_session_by_key))
        .route("/sessions/{id}/box-score", get(box_score))
        .route("/sessions/{id}/goals", get(goal_progress))
        .route("/events/{event_id}/active-session", get(active_session))
}

/// Start tracking a scheduled event, or report the session already tracking it.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session started", body = StartSessionResponse),
        (status = 200, description = "Existing session resumed or already active", body = StartSessionResponse),
        (status = 409, description = "Session key belongs to a completed session"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn start_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<StartSessionRequest>>,
) -> Result<(StatusCode, Json<StartSessionResponse>), AppError> {
    let outcome = session_registry::start_session(&state, payload.into()).await?;
    let response = StartSessionResponse::from(outcome);
    let status = match response.outcome {
        StartOutcomeKind::Started => StatusCode::CREATED,
        StartOutcomeKind::Resumed | StartOutcomeKind::AlreadyActive => StatusCode::OK,
    };
    Ok((status, Json(response)))
}

/// Session by id.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session", body = SessionSummary),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = session_registry::get_session(&state, id).await?;
    Ok(Json(session.into()))
}

/// Complete an active session. Completing a completed session succeeds without changes.
#[utoipa::path(
    post,
    path = "/sessions/{id}/complete",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session completed", body = CompleteSessionResponse),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn complete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CompleteSessionResponse>, AppError> {
    let outcome = session_registry::complete_session(&state, id).await?;
    Ok(Json(outcome.into()))
}

/// Look a session up by the key its client chose.
#[utoipa::path(
    get,
    path = "/sessions/by-key/{key}",
    tag = "sessions",
    params(("key" = String, Path, description = "Client-chosen session key")),
    responses(
        (status = 200, description = "Session", body = SessionSummary),
        (status = 404, description = "No session uses this key")
    )
)]
pub async fn get_session_by_key(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    session_registry::find_session_by_key(&state, &key)
        .await?
        .map(|session| Json(session.into()))
        .ok_or_else(|| AppError::NotFound(format!("no session with key `{key}`")))
}

/// Active session of a scheduled event, so a second device can attach to it.
#[utoipa::path(
    get,
    path = "/events/{event_id}/active-session",
    tag = "sessions",
    params(("event_id" = i64, Path, description = "Scheduled event identifier")),
    responses(
        (status = 200, description = "Active session", body = SessionSummary),
        (status = 404, description = "Event is not being tracked")
    )
)]
pub async fn active_session(
    State(state): State<SharedState>,
    Path(event_id): Path<i64>,
) -> Result<Json<SessionSummary>, AppError> {
    session_registry::active_session_for_event(&state, event_id)
        .await?
        .map(|session| Json(session.into()))
        .ok_or_else(|| AppError::NotFound(format!("event {event_id} has no active session")))
}

/// Box score recomputed from the session's live events.
#[utoipa::path(
    get,
    path = "/sessions/{id}/box-score",
    tag = "stats",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Box score", body = BoxScoreResponse),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn box_score(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BoxScoreResponse>, AppError> {
    Ok(Json(stats_service::box_score(&state, id).await?))
}

/// Progress of every configured goal evaluated at this session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/goals",
    tag = "stats",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Goal progress", body = GoalProgressResponse),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn goal_progress(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<GoalProgressResponse>, AppError> {
    Ok(Json(stats_service::goal_progress(&state, id).await?))
}
