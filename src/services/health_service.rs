use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Respond with the degraded flag and spool depth while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.store().await {
        Some(store) => {
            if let Err(err) = state.store_call(store.health_check()).await {
                warn!(error = %err, "storage health check failed");
            }
        }
        None => warn!("storage unavailable (degraded mode)"),
    }

    let pending_sync = match state.spool().pending_count().await {
        Ok(count) => count,
        Err(err) => {
            warn!(error = %err, "failed to read the sync spool");
            0
        }
    };

    if state.is_degraded() {
        HealthResponse::degraded(pending_sync)
    } else {
        HealthResponse::ok(pending_sync)
    }
}
