//! The unified server-to-permissioning poll.
//!
//! Nodes report their activity and learn network state through one
//! endpoint. The request is signed with the node's registered key; the
//! response carries fresh NDFs when the caller's hash is stale and the
//! round updates it has not yet seen.
//!
//! Lock discipline: the node's polling lock is taken here before the
//! activity transition is driven. If an effective update occurred, the
//! owned guard travels inside the enqueued notification and the scheduler
//! releases it; otherwise it is released on the way out of this module.
//! This blocks all future polls of the node until processing completes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use mixnet_common::crypto;
use mixnet_common::version::Version;
use mixnet_common::{Activity, NodeId, RoundPhase};
use mixnet_storage::Storage;

use crate::error::StateError;
use crate::ndf::SignedNdfMessage;
use crate::node_state::NodeState;
use crate::wire::{ClientError, RoundError, RoundInfo};
use crate::ServerContext;

/// Cap on the number of round updates attached to a single poll response.
pub const MAX_POLL_UPDATES: usize = 100;

/// Body of a node poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissioningPoll {
    pub node_id: NodeId,
    pub activity: Activity,
    #[serde(default)]
    pub error: Option<RoundError>,
    #[serde(default)]
    pub client_errors: Vec<ClientError>,
    /// Hash of the full NDF the node currently holds.
    #[serde(default, with = "hex")]
    pub full_ndf_hash: Vec<u8>,
    /// Last update id the node has seen; 0 for none.
    #[serde(default)]
    pub last_update: u64,
    /// Address the node advertises for itself.
    #[serde(default)]
    pub server_address: String,
    /// Address of the node's co-located gateway; empty until the gateway
    /// has reported in.
    #[serde(default)]
    pub gateway_address: String,
    #[serde(default)]
    pub gateway_version: String,
    #[serde(default)]
    pub server_version: String,
}

/// A poll plus the node's signature over the serialized body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPoll {
    pub poll: PermissioningPoll,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PermissionPollResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_ndf: Option<SignedNdfMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_ndf: Option<SignedNdfMessage>,
    pub updates: Vec<RoundInfo>,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("network definition is not ready")]
    NdfNotReady,

    #[error("authentication failed for node {0}")]
    Auth(NodeId),

    #[error("node {0} could not be found in the internal state tracker")]
    UnknownNode(NodeId),

    #[error("node {0} has been banned from the network")]
    Banned(NodeId),

    #[error("{0}")]
    Version(String),

    #[error("malformed error report: {0}")]
    MalformedError(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Handle one node poll.
pub async fn poll(
    msg: SignedPoll,
    ctx: &ServerContext,
) -> Result<PermissionPollResponse, PollError> {
    let state = &ctx.state;
    let mut response = PermissionPollResponse::default();

    if !state.is_ndf_ready() {
        return Err(PollError::NdfNotReady);
    }

    let node_id = msg.poll.node_id;
    authenticate(&msg, &ctx.storage)?;

    let node = state
        .node_map()
        .get_node(node_id)
        .ok_or(PollError::UnknownNode(node_id))?;
    node.increment_num_polls();

    // Check if the node has been deemed out of the network.
    if node.is_banned() {
        return Err(PollError::Banned(node_id));
    }

    check_version(
        ctx.min_gateway_version.as_ref(),
        ctx.min_server_version.as_ref(),
        &msg.poll,
    )?;

    check_addresses(ctx, &node, &msg.poll)?;

    // Return updated NDFs if the provided hash does not match.
    let full = state.get_full_ndf();
    if !full.compare_hash(&msg.poll.full_ndf_hash) {
        debug!(node = %node_id, "returning a new NDF to a back-end server");
        response.full_ndf = Some(full.message());
        response.partial_ndf = Some(state.get_partial_ndf().message());
    }

    // Fetch round updates the node has not seen yet, capped; a node that
    // is far behind catches up over several polls before its activity is
    // processed again.
    let updates = state.get_updates(msg.poll.last_update);
    if updates.len() > MAX_POLL_UPDATES {
        response.updates = updates[..MAX_POLL_UPDATES]
            .iter()
            .map(|u| (**u).clone())
            .collect();
        return Ok(response);
    }
    response.updates = updates.iter().map(|u| (**u).clone()).collect();

    trace!(node = %node_id, activity = %msg.poll.activity, "updating node state");

    // Catch the edge case of an error activity with no error payload.
    if msg.poll.activity == Activity::Error && msg.poll.error.is_none() {
        let err = PollError::MalformedError(format!(
            "a malformed error was received from {node_id} with no error payload"
        ));
        warn!("{err}");
        return Err(err);
    }

    // A node that has not started produces no update.
    if msg.poll.activity == Activity::NotStarted {
        return Ok(response);
    }

    // Take the polling lock. It is released by the scheduler once the
    // enqueued notification is processed, or below when there is nothing
    // to enqueue.
    let guard = node.polling_lock().lock_owned().await;

    verify_error(&msg.poll, &node, &ctx.storage)?;

    // Drives the edge-checked activity transition; a rejected change is
    // not recorded and the error propagates back to the node.
    let (updated, notification) = node.update(msg.poll.activity).map_err(PollError::State)?;
    let Some(mut notification) = notification else {
        drop(guard);
        return Ok(response);
    };
    debug_assert!(updated);

    if notification.to_activity == Activity::Error {
        // Checked non-empty above.
        let Some(reported) = msg.poll.error.clone() else {
            drop(guard);
            return Ok(response);
        };
        if reported.id == 0 {
            // No round associated with the error: tidy up a finished round
            // and keep it away from the scheduler.
            if let Some(round) = node.current_round() {
                if matches!(round.phase(), RoundPhase::Completed | RoundPhase::Failed) {
                    node.clear_round();
                }
            }
            drop(guard);
            return Ok(response);
        }
        notification.error = Some(reported);
    }

    notification.client_errors = msg.poll.client_errors.clone();
    notification.polling_guard = Some(guard);
    state
        .send_update_notification(notification)
        .map_err(PollError::State)?;

    Ok(response)
}

/// The poll must be signed by the key the node registered with.
fn authenticate(msg: &SignedPoll, storage: &Storage) -> Result<(), PollError> {
    let node_id = msg.poll.node_id;
    let record = storage
        .get_node_by_id(node_id)
        .map_err(|_| PollError::UnknownNode(node_id))?;
    let public_key = hex::decode(&record.public_key).map_err(|_| PollError::Auth(node_id))?;
    let body = serde_json::to_vec(&msg.poll).map_err(|_| PollError::Auth(node_id))?;
    let valid = crypto::eddsa_verify(&public_key, &body, &msg.signature)
        .map_err(|_| PollError::Auth(node_id))?;
    if !valid {
        return Err(PollError::Auth(node_id));
    }
    Ok(())
}

/// Gate the reported gateway and server versions against configured
/// minima. An empty gateway version is skipped, since a server may poll
/// before its gateway has ever reached it.
fn check_version(
    required_gateway: Option<&Version>,
    required_server: Option<&Version>,
    poll: &PermissioningPoll,
) -> Result<(), PollError> {
    if let Some(required) = required_gateway {
        if poll.gateway_version.is_empty() {
            debug!("gateway version string is empty, skipping gateway version check");
        } else {
            let gateway_version: Version = poll.gateway_version.parse().map_err(|_| {
                PollError::Version(format!(
                    "failed to parse gateway version {:?}",
                    poll.gateway_version
                ))
            })?;
            if !required.is_compatible(&gateway_version) {
                return Err(PollError::Version(format!(
                    "the gateway version {gateway_version} is incompatible with the required version {required}"
                )));
            }
        }
    }

    if let Some(required) = required_server {
        let server_version: Version = poll.server_version.parse().map_err(|_| {
            PollError::Version(format!(
                "failed to parse server version {:?}",
                poll.server_version
            ))
        })?;
        if !required.is_compatible(&server_version) {
            return Err(PollError::Version(format!(
                "the server version {server_version} is incompatible with the required version {required}"
            )));
        }
    }

    Ok(())
}

/// Update server and gateway addresses in state and the canonical NDF if
/// they changed, then republish.
fn check_addresses(
    ctx: &ServerContext,
    node: &NodeState,
    poll: &PermissioningPoll,
) -> Result<(), PollError> {
    let node_update = if poll.server_address.is_empty() {
        false
    } else {
        node.update_node_address(&poll.server_address)
    };
    let gateway_update = node.update_gateway_address(&poll.gateway_address);

    if !node_update && !gateway_update {
        return Ok(());
    }

    trace!(node = %node.id(), server = %poll.server_address, gateway = %poll.gateway_address,
        "updating advertised addresses");

    let mut ndf_result = Ok(());
    ctx.state.with_internal_ndf(|ndf| {
        if node_update {
            if let Err(err) = ndf.update_node_address(node.id(), &poll.server_address) {
                ndf_result = Err(err);
                return;
            }
        }
        if gateway_update {
            if let Err(err) = ndf.update_gateway_address(node.id(), &poll.gateway_address) {
                ndf_result = Err(err);
            }
        }
    });
    ndf_result.map_err(|err| PollError::State(StateError::Ndf(err)))?;

    if let Err(err) =
        ctx.storage
            .update_node_addresses(node.id(), &node.node_address(), &node.gateway_address())
    {
        warn!(node = %node.id(), %err, "could not persist updated addresses");
    }

    ctx.state.update_output_ndf().map_err(PollError::State)?;
    Ok(())
}

/// Validate an attached round error: it must reference the node's current
/// round (or no round) and be signed by the node that created it.
fn verify_error(
    poll: &PermissioningPoll,
    node: &NodeState,
    storage: &Storage,
) -> Result<(), PollError> {
    let Some(error) = &poll.error else {
        return Ok(());
    };

    if error.id != 0 {
        match node.current_round() {
            None => {
                return Err(PollError::MalformedError(
                    "node cannot submit a round error when it is not participating in a round"
                        .to_string(),
                ));
            }
            Some(round) if error.id != round.round_id().0 => {
                return Err(PollError::MalformedError(
                    "this error is not associated with the round the submitting node is participating in"
                        .to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    let signer = error.node_id.ok_or_else(|| {
        PollError::MalformedError("round error names no source node".to_string())
    })?;
    let record = storage.get_node_by_id(signer).map_err(|_| {
        PollError::MalformedError(format!("source node {signer} was not found"))
    })?;
    let public_key = hex::decode(&record.public_key)
        .map_err(|_| PollError::MalformedError(format!("source node {signer} has no valid key")))?;
    let valid = crypto::eddsa_verify(&public_key, &error.signing_digest(), &error.signature)
        .map_err(|_| PollError::MalformedError("failed to verify error signature".to_string()))?;
    if !valid {
        return Err(PollError::MalformedError(
            "failed to verify error signature".to_string(),
        ));
    }
    Ok(())
}
