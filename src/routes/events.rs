use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::event::{
        EventSummary, ListEventsQuery, RecordEventRequest, RecordEventResponse,
        RetractEventResponse,
    },
    error::AppError,
    services::ingestor,
    state::SharedState,
};

/// Event recording, listing and retraction endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route(
            "/sessions/{id}/events",
            get(list_events).post(record_event),
        )
        .route("/sessions/{id}/events/{event_id}", delete(retract_event))
}

/// Record one event on an active session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/events",
    tag = "events",
    params(("id" = Uuid, Path, description = "Session identifier")),
    request_body = RecordEventRequest,
    responses(
        (status = 201, description = "Event recorded", body = RecordEventResponse),
        (status = 200, description = "Idempotency key already recorded", body = RecordEventResponse),
        (status = 400, description = "Invalid event or unknown player"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Session is not active"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn record_event(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<RecordEventRequest>>,
) -> Result<(StatusCode, Json<RecordEventResponse>), AppError> {
    let recorded = ingestor::record_event(&state, id, payload.event, payload.idempotency_key).await?;
    let status = if recorded.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(recorded.into())))
}

/// Events of a session in aggregation order.
#[utoipa::path(
    get,
    path = "/sessions/{id}/events",
    tag = "events",
    params(("id" = Uuid, Path, description = "Session identifier"), ListEventsQuery),
    responses(
        (status = 200, description = "Events", body = [EventSummary]),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn list_events(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<EventSummary>>, AppError> {
    let events = ingestor::list_events(&state, id, query.include_deleted).await?;
    Ok(Json(events.into_iter().map(EventSummary::from).collect()))
}

/// Retract an event; it stays visible in the audit listing.
#[utoipa::path(
    delete,
    path = "/sessions/{id}/events/{event_id}",
    tag = "events",
    params(
        ("id" = Uuid, Path, description = "Session identifier"),
        ("event_id" = Uuid, Path, description = "Event identifier")
    ),
    responses(
        (status = 200, description = "Event retracted", body = RetractEventResponse),
        (status = 404, description = "Unknown session or event"),
        (status = 409, description = "Session is not active")
    )
)]
pub async fn retract_event(
    State(state): State<SharedState>,
    Path((id, event_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RetractEventResponse>, AppError> {
    let retracted = ingestor::retract_event(&state, id, event_id).await?;
    Ok(Json(retracted.into()))
}
