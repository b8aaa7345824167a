//! The node-state-change handler.
//!
//! Single-threaded reducer at the center of the scheduler: consumes one
//! [`UpdateNotification`], mutates the node map, round map and waiting
//! pool, and may emit a round update into the log. At most one call is in
//! flight because only the scheduler loop invokes it.
//!
//! The subject node's polling lock is held on entry (taken by the polling
//! endpoint before enqueueing) and travels inside the notification; it is
//! released on every exit path when the notification is dropped, which is
//! what keeps per-node updates from reordering.
//!
//! A node in waiting is added to the pool in preparation for precomputing.
//! A node in standby is counted toward its round's realtime transition.
//! A node in completed waits for the rest of the team before the round is
//! retired.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace, warn};

use mixnet_common::crypto;
use mixnet_common::{Activity, NodeId, NodeStatus, RoundPhase};
use mixnet_storage::{RoundMetric, Storage, StorageError};

use crate::error::StateError;
use crate::network_state::NetworkState;
use crate::node_state::{NodeState, UpdateNotification};
use crate::now_nanos;
use crate::round_state::RoundState;
use crate::tracker::RoundTracker;
use crate::waiting_pool::WaitingPool;
use crate::wire::{RoundError, RoundInfo};

/// Apply one node state change. Returns whether this update completed the
/// node's round.
pub fn handle_node_update(
    update: UpdateNotification,
    pool: &mut WaitingPool,
    state: &Arc<NetworkState>,
    realtime_delay: Duration,
    tracker: &RoundTracker,
) -> Result<bool, StateError> {
    // The polling guard inside `update` is dropped on every return path,
    // unblocking the node's next poll.
    let node = state
        .node_map()
        .get_node(update.node)
        .ok_or(StateError::UnknownNode(update.node))?;
    let current_round = node.current_round();

    // A node whose round already failed has nothing left to report except
    // its own error; everything else is accepted without effect and the
    // node re-enters the pool on its next waiting report.
    let round_errored = matches!(&current_round, Some(r) if r.phase() == RoundPhase::Failed)
        && update.to_activity != Activity::Error;
    if round_errored {
        return Ok(false);
    }

    if !update.client_errors.is_empty() {
        if let Some(round) = &current_round {
            round.append_client_errors(&update.client_errors);
        }
    }

    // Ban the node if it is supposed to be banned; the activity branch is
    // skipped entirely.
    if update.to_status == NodeStatus::Banned {
        return handle_banned_node(&update, &node, current_round, pool, state, tracker);
    }

    match update.to_activity {
        Activity::NotStarted => {}

        Activity::Waiting => {
            // If the node was in the offline pool, move it online.
            if update.from_status == NodeStatus::Inactive && update.to_status == NodeStatus::Active
            {
                pool.set_node_online(node);
            } else {
                pool.add(node);
            }
        }

        Activity::Precomputing => {
            // Nodes selected from the pool are assigned to precomp in the
            // round starter, so no round transition fires here.
            if current_round.is_none() {
                return Err(StateError::MissingRound {
                    node: update.node,
                    activity: Activity::Precomputing,
                });
            }
        }

        Activity::Standby => {
            let round = current_round.ok_or(StateError::MissingRound {
                node: update.node,
                activity: Activity::Standby,
            })?;
            // Transition only once the whole team has reported in.
            if round.node_is_ready_for_transition() {
                let now = now_nanos();
                round.update(RoundPhase::Standby, now)?;
                // Queue the round, stamping when realtime is to begin.
                round.update(RoundPhase::Queued, now + realtime_delay.as_nanos() as u64)?;
                state.add_round_update(round.build_round_info())?;
            }
        }

        Activity::Realtime => {
            let round = current_round.ok_or(StateError::MissingRound {
                node: update.node,
                activity: Activity::Realtime,
            })?;
            // Realtime moves on the first report, not when every node
            // reports; waiting for the whole team here would hinge on
            // distributed clocks agreeing. Later reports are idempotent.
            if round.phase() != RoundPhase::Realtime {
                round.update(RoundPhase::Realtime, now_nanos())?;
                state.add_round_update(round.build_round_info())?;
            }
        }

        Activity::Completed => {
            let round = current_round.ok_or(StateError::MissingRound {
                node: update.node,
                activity: Activity::Completed,
            })?;
            node.clear_round();
            if round.node_is_ready_for_transition() {
                round.update(RoundPhase::Completed, now_nanos())?;
                let info = round.build_round_info();
                state.add_round_update(info.clone())?;

                round.denote_completed();
                tracker.remove_active_round(round.round_id());

                if let Err(err) = store_round_metric(state.storage(), &info) {
                    warn!(round_id = %round.round_id(), %err,
                        "could not insert round metric");
                }
                return Ok(true);
            }
        }

        Activity::Error => {
            // Kill the round if the node has one.
            if let Some(round) = current_round {
                round.denote_completed();
                node.clear_round();
                let round_error = update.error.clone().unwrap_or_else(|| RoundError {
                    id: round.round_id().0,
                    node_id: Some(update.node),
                    error: "unspecified node error".to_string(),
                    signature: Vec::new(),
                });
                kill_round(state, &round, round_error, tracker)?;
            }
        }
    }

    Ok(false)
}

/// Handle an update carrying a banned status: kill the node's round if it
/// has one, otherwise drop it from the waiting pool.
fn handle_banned_node(
    update: &UpdateNotification,
    node: &Arc<NodeState>,
    current_round: Option<Arc<RoundState>>,
    pool: &mut WaitingPool,
    state: &Arc<NetworkState>,
    tracker: &RoundTracker,
) -> Result<bool, StateError> {
    if let Some(round) = current_round {
        let mut ban_error = RoundError {
            id: round.round_id().0,
            node_id: Some(NodeId::permissioning()),
            error: format!(
                "round killed due to participation of banned node {}",
                update.node
            ),
            signature: Vec::new(),
        };
        let digest = ban_error.signing_digest();
        ban_error.signature = crypto::rsa_sign_sha256(state.rsa_private_key(), &digest)?;

        node.clear_round();
        kill_round(state, &round, ban_error, tracker)?;
    } else {
        pool.ban(update.node);
    }
    Ok(false)
}

/// Kill a round: record the error, fail the round, untrack it, publish the
/// failed state, and best-effort commit metric and error rows.
pub(crate) fn kill_round(
    state: &Arc<NetworkState>,
    round: &Arc<RoundState>,
    round_error: RoundError,
    tracker: &RoundTracker,
) -> Result<(), StateError> {
    round.append_error(round_error.clone());

    if round.update(RoundPhase::Failed, now_nanos()).is_ok() {
        tracker.remove_active_round(round.round_id());
    }

    let info = round.build_round_info();
    state.add_round_update(info.clone())?;

    if let Err(err) = store_round_metric(state.storage(), &info) {
        warn!(round_id = %round.round_id(), %err, "could not insert round metric");
    }

    let source = round_error
        .node_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let formatted = format!("round error from {source}: {}", round_error.error);
    info!("{formatted}");

    if let Err(err) = state.storage().insert_round_error(round.round_id(), &formatted) {
        warn!(round_id = %round.round_id(), %err, "could not insert round error");
    }

    Ok(())
}

/// Insert metrics about a finished round into storage. For a failed round
/// the realtime window closes at the failure timestamp.
pub(crate) fn store_round_metric(
    storage: &Storage,
    info: &RoundInfo,
) -> Result<(), StorageError> {
    let realtime_end_phase = if info.state == RoundPhase::Failed {
        RoundPhase::Failed
    } else {
        RoundPhase::Completed
    };

    let metric = RoundMetric {
        id: info.id,
        precomp_start: info.timestamp(RoundPhase::Precomputing),
        precomp_end: info.timestamp(RoundPhase::Standby),
        realtime_start: info.timestamp(RoundPhase::Realtime),
        realtime_end: info.timestamp(realtime_end_phase),
        batch_size: info.batch_size,
    };

    trace!(
        round_id = %info.id,
        precomp_ns = metric.precomp_end.saturating_sub(metric.precomp_start),
        realtime_ns = metric.realtime_end.saturating_sub(metric.realtime_start),
        "round durations"
    );

    storage.insert_round_metric(metric, &info.topology)
}
