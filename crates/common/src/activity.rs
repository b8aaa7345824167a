//! Node activity lifecycle.
//!
//! Every mix node self-reports an activity on each poll. The set of allowed
//! progressions is a closed DAG with a single loop back to `Waiting` once a
//! round finishes:
//!
//! ```text
//! NotStarted → Waiting → Precomputing → Standby → Realtime → Completed
//!                 ↑                                              │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! Any activity may additionally move to `Error`. Reporting the current
//! activity again is tolerated as a no-op rather than rejected, since nodes
//! poll continuously.
//!
//! Activities split into two structural classes: those that only make sense
//! while the node holds a round assignment, and those that require it to
//! hold none. The class drives the precondition checks performed before a
//! transition is accepted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::phase::RoundPhase;

/// Self-reported lifecycle state of a mix node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activity {
    NotStarted,
    Waiting,
    Precomputing,
    Standby,
    Realtime,
    Completed,
    Error,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Activity::NotStarted => "NOT_STARTED",
            Activity::Waiting => "WAITING",
            Activity::Precomputing => "PRECOMPUTING",
            Activity::Standby => "STANDBY",
            Activity::Realtime => "REALTIME",
            Activity::Completed => "COMPLETED",
            Activity::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl Activity {
    /// Activities a node may arrive at `self` from. Self-transitions are
    /// handled separately (as no-ops) and `Error` is reachable from anywhere,
    /// so neither appears here.
    pub fn valid_from(self) -> &'static [Activity] {
        match self {
            Activity::NotStarted => &[],
            Activity::Waiting => &[Activity::NotStarted, Activity::Completed, Activity::Error],
            Activity::Precomputing => &[Activity::Waiting],
            Activity::Standby => &[Activity::Precomputing],
            Activity::Realtime => &[Activity::Standby],
            Activity::Completed => &[Activity::Realtime],
            Activity::Error => &[
                Activity::NotStarted,
                Activity::Waiting,
                Activity::Precomputing,
                Activity::Standby,
                Activity::Realtime,
                Activity::Completed,
            ],
        }
    }

    /// Whether the progression `from` to `self` is on the DAG.
    pub fn is_valid_from(self, from: Activity) -> bool {
        self.valid_from().contains(&from)
    }

    /// Activities that only make sense while the node holds a round.
    pub fn requires_round(self) -> bool {
        matches!(
            self,
            Activity::Precomputing | Activity::Standby | Activity::Realtime | Activity::Completed
        )
    }

    /// Activities that require the node to hold no round.
    pub fn forbids_round(self) -> bool {
        matches!(self, Activity::NotStarted | Activity::Waiting)
    }

    /// For a requires-round activity, the round phases the node's current
    /// round may be in when the report arrives. Empty for activities with no
    /// phase precondition.
    ///
    /// `Realtime` and `Completed` accept the already-advanced phase because
    /// the round moves on the first reporter and the rest of the team
    /// trails behind.
    pub fn allowed_round_phases(self) -> &'static [RoundPhase] {
        match self {
            Activity::Precomputing => &[RoundPhase::Precomputing],
            Activity::Standby => &[RoundPhase::Precomputing],
            Activity::Realtime => &[RoundPhase::Queued, RoundPhase::Realtime],
            Activity::Completed => &[RoundPhase::Realtime, RoundPhase::Completed],
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_progressions_valid() {
        assert!(Activity::Waiting.is_valid_from(Activity::NotStarted));
        assert!(Activity::Precomputing.is_valid_from(Activity::Waiting));
        assert!(Activity::Standby.is_valid_from(Activity::Precomputing));
        assert!(Activity::Realtime.is_valid_from(Activity::Standby));
        assert!(Activity::Completed.is_valid_from(Activity::Realtime));
        // Loop back for re-pooling.
        assert!(Activity::Waiting.is_valid_from(Activity::Completed));
        assert!(Activity::Waiting.is_valid_from(Activity::Error));
    }

    #[test]
    fn test_skipping_states_invalid() {
        assert!(!Activity::Completed.is_valid_from(Activity::Waiting));
        assert!(!Activity::Realtime.is_valid_from(Activity::Precomputing));
        assert!(!Activity::Standby.is_valid_from(Activity::Waiting));
        assert!(!Activity::Precomputing.is_valid_from(Activity::Completed));
    }

    #[test]
    fn test_error_reachable_from_all() {
        for from in [
            Activity::NotStarted,
            Activity::Waiting,
            Activity::Precomputing,
            Activity::Standby,
            Activity::Realtime,
            Activity::Completed,
        ] {
            assert!(Activity::Error.is_valid_from(from), "from {from}");
        }
    }

    #[test]
    fn test_round_requirement_classes() {
        assert!(Activity::Precomputing.requires_round());
        assert!(Activity::Completed.requires_round());
        assert!(Activity::Waiting.forbids_round());
        assert!(Activity::NotStarted.forbids_round());
        assert!(!Activity::Error.requires_round());
        assert!(!Activity::Error.forbids_round());
    }

    #[test]
    fn test_realtime_accepts_queued_and_realtime_rounds() {
        let phases = Activity::Realtime.allowed_round_phases();
        assert!(phases.contains(&RoundPhase::Queued));
        assert!(phases.contains(&RoundPhase::Realtime));
        assert!(!phases.contains(&RoundPhase::Standby));
    }
}
