//! The round starter task.
//!
//! Receives proto-rounds from the scheduler in order and brings each one to
//! life: spaces starts by the configured minimum delay, creates the round
//! state, assigns the team, and publishes the first round update. Any error
//! is surfaced to the scheduler, which exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};

use mixnet_common::{NodeId, RoundPhase};

use crate::error::StateError;
use crate::network_state::NetworkState;
use crate::now_nanos;
use crate::scheduler::ProtoRound;
use crate::tracker::RoundTracker;

pub(crate) async fn round_starter(
    state: Arc<NetworkState>,
    tracker: RoundTracker,
    mut round_rx: mpsc::Receiver<ProtoRound>,
    error_tx: mpsc::Sender<StateError>,
    minimum_delay: Duration,
) {
    let mut last_start: Option<Instant> = None;

    while let Some(proto) = round_rx.recv().await {
        // Space round starts: sleep out the remainder of the minimum delay
        // since the previous start.
        if let Some(last) = last_start {
            let elapsed = last.elapsed();
            if elapsed < minimum_delay {
                tokio::time::sleep(minimum_delay - elapsed).await;
            }
        }
        last_start = Some(Instant::now());

        if let Err(err) = start_round(proto, &state, &tracker) {
            error!(%err, "could not start round");
            let _ = error_tx.send(err).await;
            return;
        }
    }
}

/// Create the round, assign every team member to it, move it into
/// precomputation and publish the first update.
pub(crate) fn start_round(
    proto: ProtoRound,
    state: &Arc<NetworkState>,
    tracker: &RoundTracker,
) -> Result<(), StateError> {
    let topology: Vec<NodeId> = proto.node_states.iter().map(|n| n.id()).collect();
    let round = state.round_map().add_round(
        proto.round_id,
        proto.batch_size,
        topology,
        state.address_space_size(),
    )?;

    // Assign the current round pointer before the precomputing transition
    // can be accepted from any member. A node that already holds a round
    // here lost the extraction-to-start race, which is fatal.
    for node in &proto.node_states {
        node.set_round(Arc::clone(&round))?;
    }

    round.update(RoundPhase::Precomputing, now_nanos())?;
    state.add_round_update(round.build_round_info())?;
    tracker.add_active_round(round.round_id());

    info!(round_id = %round.round_id(), team_size = round.team_size(), "round started");
    Ok(())
}
