//! Round phase lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of round phases, and therefore the length of the per-round
/// timestamp vector (one slot per phase).
pub const NUM_PHASES: usize = 7;

/// Lifecycle phase of a mixing round.
///
/// Phases advance monotonically in declaration order, with the single
/// exception that any non-failed phase may jump to `Failed` when the round
/// is killed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Pending,
    Precomputing,
    Standby,
    Queued,
    Realtime,
    Completed,
    Failed,
}

impl RoundPhase {
    /// Index of the phase's slot in the round timestamp vector.
    pub fn index(self) -> usize {
        match self {
            RoundPhase::Pending => 0,
            RoundPhase::Precomputing => 1,
            RoundPhase::Standby => 2,
            RoundPhase::Queued => 3,
            RoundPhase::Realtime => 4,
            RoundPhase::Completed => 5,
            RoundPhase::Failed => 6,
        }
    }

    /// Whether a round in `self` may move to `to`.
    pub fn can_advance_to(self, to: RoundPhase) -> bool {
        if self == RoundPhase::Failed {
            return false;
        }
        to == RoundPhase::Failed || to.index() > self.index()
    }

    /// Terminal phases retire the round; no member report can drive it
    /// further.
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Completed | RoundPhase::Failed)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::Pending => "PENDING",
            RoundPhase::Precomputing => "PRECOMPUTING",
            RoundPhase::Standby => "STANDBY",
            RoundPhase::Queued => "QUEUED",
            RoundPhase::Realtime => "REALTIME",
            RoundPhase::Completed => "COMPLETED",
            RoundPhase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
