use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use uuid::Uuid;

/// Orders live score snapshots per session.
///
/// A revision is taken once the triggering write has landed, so a snapshot
/// computed for a higher revision never reflects fewer writes than a lower one.
#[derive(Default)]
pub struct ScoreRevisions {
    next: AtomicU64,
    published: DashMap<Uuid, u64>,
}

impl ScoreRevisions {
    /// Allocate the revision of a snapshot about to be computed.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run `publish` unless a newer revision of `session_id` was already published.
    ///
    /// `publish` runs while the session's entry is locked, so two snapshots of the
    /// same session always go out in revision order.
    pub fn publish_if_newer(&self, session_id: Uuid, revision: u64, publish: impl FnOnce()) -> bool {
        let mut latest = self.published.entry(session_id).or_insert(0);
        if *latest >= revision {
            return false;
        }
        *latest = revision;
        publish();
        true
    }

    /// Forget a session that will not produce further snapshots.
    pub fn forget(&self, session_id: Uuid) {
        self.published.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_snapshots_are_dropped() {
        let revisions = ScoreRevisions::default();
        let session = Uuid::new_v4();
        let (older, newer) = (revisions.next(), revisions.next());

        let mut sent = Vec::new();
        assert!(revisions.publish_if_newer(session, newer, || sent.push(newer)));
        assert!(!revisions.publish_if_newer(session, older, || sent.push(older)));
        assert_eq!(sent, vec![newer]);
    }

    #[test]
    fn sessions_are_ordered_independently() {
        let revisions = ScoreRevisions::default();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let older = revisions.next();
        let newer = revisions.next();

        assert!(revisions.publish_if_newer(first, newer, || {}));
        assert!(revisions.publish_if_newer(second, older, || {}));

        revisions.forget(first);
        assert!(revisions.publish_if_newer(first, older, || {}));
    }
}
