//! The round scheduler.
//!
//! Business logic for forming teams out of waiting nodes and driving their
//! rounds: the loop owns the node-update handler, watches the waiting pool,
//! and dispatches proto-rounds to the round starter. It is expected to run
//! for the lifetime of the process; it exits only on a handler or starter
//! error, or when the kill channel fires.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use mixnet_common::RoundId;

use crate::error::StateError;
use crate::network_state::NetworkState;
use crate::node_state::NodeState;
use crate::node_updates::handle_node_update;
use crate::starter;
use crate::tracker::RoundTracker;
use crate::waiting_pool::WaitingPool;

/// Teaming parameters of the scheduler.
pub use mixnet_common::config::SchedulingConfig as Params;

/// Size of the round creation channel; large enough to never jam.
const NEW_ROUND_CHAN_LEN: usize = 100;

/// A round waiting to be created: the team in topology order and the batch
/// size to stamp on it.
pub struct ProtoRound {
    pub round_id: RoundId,
    pub node_states: Vec<Arc<NodeState>>,
    pub batch_size: u32,
}

/// Run the scheduler until an error surfaces or the kill channel fires.
///
/// The kill channel carries a reply sender; on receipt the loop stops
/// dequeueing updates, waits up to `close_timeout` for in-flight round
/// starts, then answers the reply.
pub async fn run(
    params: Params,
    state: Arc<NetworkState>,
    tracker: RoundTracker,
    mut kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    close_timeout: Duration,
) -> Result<(), StateError> {
    let mut pool = WaitingPool::new();
    let mut update_rx = state
        .take_update_receiver()
        .ok_or(StateError::SchedulerAlreadyRunning)?;

    let (round_tx, round_rx) = mpsc::channel::<ProtoRound>(NEW_ROUND_CHAN_LEN);
    let (error_tx, mut error_rx) = mpsc::channel::<StateError>(1);

    let starter_handle = tokio::spawn(starter::round_starter(
        Arc::clone(&state),
        tracker.clone(),
        round_rx,
        error_tx,
        Duration::from_millis(params.minimum_delay_ms),
    ));

    let realtime_delay = Duration::from_millis(params.realtime_delay_ms);
    info!(
        team_size = params.team_size,
        batch_size = params.batch_size,
        random_ordering = params.random_ordering,
        "scheduler started"
    );

    loop {
        tokio::select! {
            Some(err) = error_rx.recv() => {
                error!(%err, "round starter failed, scheduler exiting");
                drop(round_tx);
                return Err(err);
            }

            Some(reply) = kill_rx.recv() => {
                // Stop dequeueing and give in-flight round starts a bounded
                // chance to finish.
                drop(round_tx);
                if tokio::time::timeout(close_timeout, starter_handle).await.is_err() {
                    warn!("timed out waiting for in-flight round starts");
                }
                let _ = reply.send(());
                return Ok(());
            }

            maybe_update = update_rx.recv() => {
                let Some(update) = maybe_update else {
                    return Err(StateError::UpdateChannelClosed);
                };

                handle_node_update(update, &mut pool, &state, realtime_delay, &tracker)?;

                // Create a new round whenever the pool fills.
                if pool.len() == params.team_size as usize {
                    let proto = create_round(&params, &mut pool, &state)?;
                    if round_tx.send(proto).await.is_err() {
                        return Err(StateError::RoundCreationStopped);
                    }
                }
            }
        }
    }
}

/// Extract a full team from the pool and describe the round to create.
/// Insertion order becomes topology order unless random ordering is on;
/// a node's position in the list is a durable attribute of the round.
fn create_round(
    params: &Params,
    pool: &mut WaitingPool,
    state: &Arc<NetworkState>,
) -> Result<ProtoRound, StateError> {
    let mut team = pool.extract_team(params.team_size as usize);
    if params.random_ordering {
        team.shuffle(&mut rand::thread_rng());
    }

    let round_id = state.increment_round_id()?;
    info!(%round_id, team_size = team.len(), "forming team");

    Ok(ProtoRound {
        round_id,
        node_states: team,
        batch_size: params.batch_size,
    })
}
