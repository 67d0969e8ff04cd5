use tracing::info;

use crate::{
    services::{
        goal_progress::GoalStatusChange,
        sse_events::{EVENT_GOAL_STATUS_CHANGED, send_live_event},
    },
    state::SseHub,
};

/// Receiver of goal status changes. Delivery is fire-and-forget.
pub trait Notifier: Send + Sync {
    /// Deliver one status change; never fails the caller.
    fn notify(&self, change: GoalStatusChange);
}

/// Notifier publishing status changes on the live SSE feed.
pub struct SseNotifier {
    hub: SseHub,
}

impl SseNotifier {
    /// Notifier publishing on `hub`.
    pub fn new(hub: SseHub) -> Self {
        Self { hub }
    }
}

impl Notifier for SseNotifier {
    fn notify(&self, change: GoalStatusChange) {
        info!(
            goal_id = %change.goal_id,
            previous = ?change.previous,
            current = ?change.current,
            "goal status changed"
        );
        send_live_event(&self.hub, EVENT_GOAL_STATUS_CHANGED, &change);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::services::goal_progress::GoalStatus;

    #[test]
    fn status_changes_reach_live_subscribers() {
        let hub = SseHub::new(4);
        let mut receiver = hub.subscribe();
        let notifier = SseNotifier::new(hub);

        notifier.notify(GoalStatusChange {
            goal_id: "ppg".into(),
            goal_name: "Points per game".into(),
            session_id: Uuid::nil(),
            previous: GoalStatus::OnTrack,
            current: GoalStatus::OffTrack,
            actual_value: Some(40.0),
            target_value: 60.0,
        });

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.event.as_deref(), Some(EVENT_GOAL_STATUS_CHANGED));
        assert!(event.data.contains("\"current\":\"off_track\""));
    }
}
