//! Error taxonomy of the coordinator core.
//!
//! Handler errors abort the scheduler; `BufferFull` is surfaced to the
//! polling endpoint; signing failures are fatal to the process because the
//! update log would otherwise become inconsistent; storage failures on
//! metric writes are logged and swallowed at the call site and never reach
//! this type's fatal paths.

use thiserror::Error;

use mixnet_common::crypto::CryptoError;
use mixnet_common::{Activity, NodeId, RoundId, RoundPhase};
use mixnet_storage::StorageError;

use crate::ndf::NdfError;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Activity, to: Activity },

    #[error("node {node} without a round should not be in the {activity} state")]
    MissingRound { node: NodeId, activity: Activity },

    #[error("moving to {activity} requires that node {node} not be assigned a round")]
    UnexpectedRound { node: NodeId, activity: Activity },

    #[error("node {node} cannot enter {activity} while its round is in the {phase} phase")]
    WrongRoundPhase {
        node: NodeId,
        activity: Activity,
        phase: RoundPhase,
    },

    #[error("could not assign round {round} to node {node}: round {existing} is already set")]
    InvalidAssignment {
        node: NodeId,
        round: RoundId,
        existing: RoundId,
    },

    #[error("round {round} cannot move from {from} to {to}")]
    InvalidRoundTransition {
        round: RoundId,
        from: RoundPhase,
        to: RoundPhase,
    },

    #[error("node {0} is already tracked")]
    DuplicateNode(NodeId),

    #[error("node {0} could not be found in the state tracker")]
    UnknownNode(NodeId),

    #[error("round {0} is already tracked")]
    DuplicateRound(RoundId),

    #[error("could not send update notification: channel is full")]
    BufferFull,

    #[error("node update channel closed")]
    UpdateChannelClosed,

    #[error("the scheduler is already running")]
    SchedulerAlreadyRunning,

    #[error("round creation stopped")]
    RoundCreationStopped,

    #[error(transparent)]
    Signing(#[from] CryptoError),

    #[error(transparent)]
    Ndf(#[from] NdfError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
