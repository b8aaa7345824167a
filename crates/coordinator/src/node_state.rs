//! Per-node state tracking.
//!
//! A [`NodeState`] is created when a node registers and lives for the
//! process lifetime. Its activity may only change through [`NodeState::update`],
//! which enforces the activity DAG together with the structural round
//! preconditions. A successful effective update yields the
//! [`UpdateNotification`] that the polling endpoint enqueues for the
//! scheduler.
//!
//! The polling lock gives each node at-most-one in-flight update: the
//! endpoint takes it before enqueueing and its owned guard travels inside
//! the notification, so whichever path finishes with the notification
//! releases the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use mixnet_common::{Activity, NodeId, NodeStatus};

use crate::error::StateError;
use crate::now_nanos;
use crate::round_state::RoundState;
use crate::wire::{ClientError, RoundError};

/// A change of node state, as handed to the scheduler.
#[derive(Debug)]
pub struct UpdateNotification {
    pub node: NodeId,
    pub from_activity: Activity,
    pub to_activity: Activity,
    pub from_status: NodeStatus,
    pub to_status: NodeStatus,
    pub error: Option<RoundError>,
    pub client_errors: Vec<ClientError>,
    /// The node's polling lock, held from the endpoint until the handler
    /// finishes with this notification.
    pub polling_guard: Option<OwnedMutexGuard<()>>,
}

impl UpdateNotification {
    /// A notification carrying no error payloads and no polling guard.
    pub fn new(
        node: NodeId,
        from_activity: Activity,
        to_activity: Activity,
        from_status: NodeStatus,
        to_status: NodeStatus,
    ) -> UpdateNotification {
        UpdateNotification {
            node,
            from_activity,
            to_activity,
            from_status,
            to_status,
            error: None,
            client_errors: Vec::new(),
            polling_guard: None,
        }
    }
}

struct NodeInner {
    activity: Activity,
    status: NodeStatus,
    current_round: Option<Arc<RoundState>>,
    last_poll: u64,
    node_address: String,
    gateway_address: String,
}

/// Tracked state of one registered node.
pub struct NodeState {
    id: NodeId,
    /// Ordering tag from the registration record, consumed by teaming.
    ordering: String,
    num_polls: AtomicU64,
    polling_lock: Arc<tokio::sync::Mutex<()>>,
    inner: Mutex<NodeInner>,
}

impl NodeState {
    fn new(id: NodeId, ordering: &str, node_address: &str, gateway_address: &str) -> NodeState {
        NodeState {
            id,
            ordering: ordering.to_string(),
            num_polls: AtomicU64::new(0),
            polling_lock: Arc::new(tokio::sync::Mutex::new(())),
            inner: Mutex::new(NodeInner {
                activity: Activity::NotStarted,
                status: NodeStatus::Active,
                current_round: None,
                last_poll: 0,
                node_address: node_address.to_string(),
                gateway_address: gateway_address.to_string(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ordering(&self) -> &str {
        &self.ordering
    }

    pub fn polling_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.polling_lock)
    }

    pub fn increment_num_polls(&self) {
        self.num_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_polls(&self) -> u64 {
        self.num_polls.load(Ordering::Relaxed)
    }

    /// Read and reset the poll counter, one monitoring window at a time.
    pub fn take_num_polls(&self) -> u64 {
        self.num_polls.swap(0, Ordering::Relaxed)
    }

    pub fn activity(&self) -> Activity {
        self.inner.lock().activity
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.inner.lock().status = status;
    }

    pub fn is_banned(&self) -> bool {
        self.status() == NodeStatus::Banned
    }

    pub fn last_poll(&self) -> u64 {
        self.inner.lock().last_poll
    }

    pub fn set_last_poll(&self, when: u64) {
        self.inner.lock().last_poll = when;
    }

    pub fn current_round(&self) -> Option<Arc<RoundState>> {
        self.inner.lock().current_round.clone()
    }

    /// Assign the node to a round. The node must not already hold one; a
    /// conflict here means the extraction-to-start race was lost and is
    /// fatal to the scheduler.
    pub fn set_round(&self, round: Arc<RoundState>) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.current_round {
            return Err(StateError::InvalidAssignment {
                node: self.id,
                round: round.round_id(),
                existing: existing.round_id(),
            });
        }
        inner.current_round = Some(round);
        Ok(())
    }

    pub fn clear_round(&self) {
        self.inner.lock().current_round = None;
    }

    pub fn node_address(&self) -> String {
        self.inner.lock().node_address.clone()
    }

    pub fn gateway_address(&self) -> String {
        self.inner.lock().gateway_address.clone()
    }

    /// Record a newly advertised server address; returns whether it changed.
    pub fn update_node_address(&self, address: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.node_address == address {
            return false;
        }
        inner.node_address = address.to_string();
        true
    }

    /// Record a newly advertised gateway address; returns whether it
    /// changed. An empty address is ignored (the gateway has not polled
    /// through its node yet).
    pub fn update_gateway_address(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.gateway_address == address {
            return false;
        }
        inner.gateway_address = address.to_string();
        true
    }

    /// Drive the activity state machine.
    ///
    /// Performs edge checking: the reported change must be on the DAG and
    /// the node's round assignment (and that round's phase) must allow it.
    /// Rejected changes mutate nothing and surface an error to the caller.
    /// Reporting the current activity is a tolerated no-op.
    ///
    /// Returns whether an effective update occurred and, if so, the
    /// notification to enqueue for the scheduler.
    pub fn update(
        &self,
        to: Activity,
    ) -> Result<(bool, Option<UpdateNotification>), StateError> {
        let mut inner = self.inner.lock();
        inner.last_poll = now_nanos();

        let from = inner.activity;
        if from == to {
            return Ok((false, None));
        }
        if !to.is_valid_from(from) {
            return Err(StateError::InvalidTransition { from, to });
        }
        if to.requires_round() {
            match &inner.current_round {
                None => {
                    return Err(StateError::MissingRound { node: self.id, activity: to });
                }
                Some(round) => {
                    let phase = round.phase();
                    if !to.allowed_round_phases().contains(&phase) {
                        return Err(StateError::WrongRoundPhase {
                            node: self.id,
                            activity: to,
                            phase,
                        });
                    }
                }
            }
        }
        if to.forbids_round() && inner.current_round.is_some() {
            return Err(StateError::UnexpectedRound { node: self.id, activity: to });
        }

        inner.activity = to;
        let notification =
            UpdateNotification::new(self.id, from, to, inner.status, inner.status);
        Ok((true, Some(notification)))
    }
}

/// The keyed set of all tracked nodes. Reads are concurrent; nodes are only
/// added by the registration endpoint.
#[derive(Default)]
pub struct NodeMap {
    nodes: RwLock<HashMap<NodeId, Arc<NodeState>>>,
}

impl NodeMap {
    pub fn new() -> NodeMap {
        NodeMap::default()
    }

    pub fn add_node(
        &self,
        id: NodeId,
        ordering: &str,
        node_address: &str,
        gateway_address: &str,
    ) -> Result<(), StateError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            return Err(StateError::DuplicateNode(id));
        }
        nodes.insert(id, Arc::new(NodeState::new(id, ordering, node_address, gateway_address)));
        Ok(())
    }

    pub fn get_node(&self, id: NodeId) -> Option<Arc<NodeState>> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn get_node_states(&self) -> Vec<Arc<NodeState>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
