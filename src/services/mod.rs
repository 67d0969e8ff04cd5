/// Pure fold of session events into scores and box scores.
pub mod aggregator;
/// OpenAPI documentation generation.
pub mod documentation;
/// Goal classification against aggregated statistics.
pub mod goal_progress;
/// Health check service.
pub mod health_service;
/// Event validation, recording and retraction.
pub mod ingestor;
/// Delivery of goal status changes.
pub mod notifier;
/// Durable buffer of events awaiting replay.
pub mod offline_queue;
/// Session lifecycle: start, resume, complete.
pub mod session_registry;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events streaming.
pub mod sse_service;
/// Box score and goal progress reads.
pub mod stats_service;
/// Storage connection supervisor with backoff.
pub mod storage_supervisor;
/// Replay of offline-queued events.
pub mod sync_reconciler;
/// Batch sync endpoint logic and spool draining.
pub mod sync_service;
