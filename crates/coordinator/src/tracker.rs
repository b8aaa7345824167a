//! Tracking of rounds that are currently in flight.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use mixnet_common::RoundId;

/// Set of active round ids. Rounds are added by the round starter and
/// removed on completion or failure.
#[derive(Clone, Default)]
pub struct RoundTracker {
    active: Arc<Mutex<HashSet<RoundId>>>,
}

impl RoundTracker {
    pub fn new() -> RoundTracker {
        RoundTracker::default()
    }

    pub fn add_active_round(&self, id: RoundId) {
        self.active.lock().insert(id);
    }

    pub fn remove_active_round(&self, id: RoundId) {
        self.active.lock().remove(&id);
    }

    pub fn contains(&self, id: RoundId) -> bool {
        self.active.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    pub fn active_rounds(&self) -> Vec<RoundId> {
        self.active.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let tracker = RoundTracker::new();
        tracker.add_active_round(RoundId(1));
        tracker.add_active_round(RoundId(2));
        assert!(tracker.contains(RoundId(1)));
        assert_eq!(tracker.len(), 2);

        tracker.remove_active_round(RoundId(1));
        assert!(!tracker.contains(RoundId(1)));
        assert_eq!(tracker.len(), 1);

        // removing an untracked round is harmless
        tracker.remove_active_round(RoundId(9));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = RoundTracker::new();
        let other = tracker.clone();
        tracker.add_active_round(RoundId(7));
        assert!(other.contains(RoundId(7)));
    }
}
