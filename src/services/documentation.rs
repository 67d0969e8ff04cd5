use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Courtside Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::live_stream,
        crate::routes::sessions::start_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::complete_session,
        crate::routes::sessions::get_session_by_key,
        crate::routes::sessions::active_session,
        crate::routes::sessions::box_score,
        crate::routes::sessions::goal_progress,
        crate::routes::events::record_event,
        crate::routes::events::list_events,
        crate::routes::events::retract_event,
        crate::routes::sync::sync_batch,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::StartSessionRequest,
            crate::dto::session::StartSessionResponse,
            crate::dto::session::CompleteSessionResponse,
            crate::dto::event::RecordEventRequest,
            crate::dto::event::RecordEventResponse,
            crate::dto::event::RetractEventResponse,
            crate::dto::box_score::BoxScoreResponse,
            crate::dto::goal::GoalProgressResponse,
            crate::dto::sync::SyncBatchRequest,
            crate::dto::sync::SyncBatchResponse,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::ScoreUpdateEvent,
            crate::dto::sse::SessionLifecycleEvent,
            crate::services::goal_progress::GoalStatusChange,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "sessions", description = "Live tracking session lifecycle"),
        (name = "events", description = "Recording and retracting game events"),
        (name = "stats", description = "Box scores and goal progress"),
        (name = "sync", description = "Replay of events recorded offline"),
    )
)]
/// OpenAPI document of the HTTP API.
pub struct ApiDoc;
