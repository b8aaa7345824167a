//! Per-round state tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mixnet_common::phase::NUM_PHASES;
use mixnet_common::{NodeId, RoundId, RoundPhase};

use crate::error::StateError;
use crate::now_nanos;
use crate::wire::{ClientError, RoundError, RoundInfo};

struct RoundInner {
    phase: RoundPhase,
    timestamps: [u64; NUM_PHASES],
    errors: Vec<RoundError>,
    client_errors: Vec<ClientError>,
    /// Counts member reports toward the next synchronized transition;
    /// resets when the full team has reported.
    ready: u32,
}

/// State of one mixing round. The topology and batch size are fixed at
/// creation; the phase advances monotonically until the round retires in
/// `Completed` or `Failed`.
pub struct RoundState {
    id: RoundId,
    batch_size: u32,
    topology: Vec<NodeId>,
    address_space_size: u32,
    completed: AtomicBool,
    inner: Mutex<RoundInner>,
}

impl RoundState {
    pub fn new(
        id: RoundId,
        batch_size: u32,
        topology: Vec<NodeId>,
        address_space_size: u32,
    ) -> RoundState {
        let mut timestamps = [0u64; NUM_PHASES];
        timestamps[RoundPhase::Pending.index()] = now_nanos();
        RoundState {
            id,
            batch_size,
            topology,
            address_space_size,
            completed: AtomicBool::new(false),
            inner: Mutex::new(RoundInner {
                phase: RoundPhase::Pending,
                timestamps,
                errors: Vec::new(),
                client_errors: Vec::new(),
                ready: 0,
            }),
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.id
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn topology(&self) -> &[NodeId] {
        &self.topology
    }

    pub fn team_size(&self) -> u32 {
        self.topology.len() as u32
    }

    pub fn phase(&self) -> RoundPhase {
        self.inner.lock().phase
    }

    pub fn timestamp(&self, phase: RoundPhase) -> u64 {
        self.inner.lock().timestamps[phase.index()]
    }

    /// Advance the round's phase, stamping the target phase's timestamp
    /// slot. Rejects non-monotonic changes; any phase may move to `Failed`.
    pub fn update(&self, to: RoundPhase, timestamp: u64) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if !inner.phase.can_advance_to(to) {
            return Err(StateError::InvalidRoundTransition {
                round: self.id,
                from: inner.phase,
                to,
            });
        }
        inner.phase = to;
        inner.timestamps[to.index()] = timestamp;
        Ok(())
    }

    /// Record one member report toward the next synchronized transition.
    /// Returns true on exactly the report that completes the team, and
    /// resets the counter so the same round can synchronize again at its
    /// next barrier.
    pub fn node_is_ready_for_transition(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.ready += 1;
        if inner.ready >= self.team_size() {
            inner.ready = 0;
            return true;
        }
        false
    }

    pub fn append_error(&self, error: RoundError) {
        self.inner.lock().errors.push(error);
    }

    pub fn errors(&self) -> Vec<RoundError> {
        self.inner.lock().errors.clone()
    }

    pub fn append_client_errors(&self, errors: &[ClientError]) {
        self.inner.lock().client_errors.extend_from_slice(errors);
    }

    pub fn client_errors(&self) -> Vec<ClientError> {
        self.inner.lock().client_errors.clone()
    }

    /// Signal that the round will receive no further member reports.
    pub fn denote_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Snapshot the round into an unsigned log entry. The update id and
    /// signatures are attached by the network state when appended.
    pub fn build_round_info(&self) -> RoundInfo {
        let inner = self.inner.lock();
        RoundInfo {
            id: self.id,
            update_id: 0,
            state: inner.phase,
            batch_size: self.batch_size,
            topology: self.topology.clone(),
            timestamps: inner.timestamps.to_vec(),
            address_space_size: self.address_space_size,
            rsa_signature: Vec::new(),
            eddsa_signature: Vec::new(),
        }
    }
}

/// The keyed set of rounds, guarded by a map-level mutex. Writers are the
/// round starter (creation) and the node-update handler (phase changes via
/// the contained `RoundState`s).
#[derive(Default)]
pub struct RoundMap {
    rounds: Mutex<HashMap<RoundId, Arc<RoundState>>>,
}

impl RoundMap {
    pub fn new() -> RoundMap {
        RoundMap::default()
    }

    pub fn add_round(
        &self,
        id: RoundId,
        batch_size: u32,
        topology: Vec<NodeId>,
        address_space_size: u32,
    ) -> Result<Arc<RoundState>, StateError> {
        let mut rounds = self.rounds.lock();
        if rounds.contains_key(&id) {
            return Err(StateError::DuplicateRound(id));
        }
        let round = Arc::new(RoundState::new(id, batch_size, topology, address_space_size));
        rounds.insert(id, Arc::clone(&round));
        Ok(round)
    }

    pub fn get_round(&self, id: RoundId) -> Option<Arc<RoundState>> {
        self.rounds.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::id::ID_DATA_LEN;
    use mixnet_common::IdType;

    fn nid(seed: u8) -> NodeId {
        NodeId::new([seed; ID_DATA_LEN], IdType::Node)
    }

    fn team() -> Vec<NodeId> {
        vec![nid(1), nid(2), nid(3)]
    }

    #[test]
    fn test_phase_advance_and_stamp() {
        let r = RoundState::new(RoundId(1), 32, team(), 16);
        assert_eq!(r.phase(), RoundPhase::Pending);
        assert!(r.timestamp(RoundPhase::Pending) > 0);

        r.update(RoundPhase::Precomputing, 42).expect("advance");
        assert_eq!(r.phase(), RoundPhase::Precomputing);
        assert_eq!(r.timestamp(RoundPhase::Precomputing), 42);

        let err = r.update(RoundPhase::Pending, 43).expect_err("backwards");
        assert!(matches!(err, StateError::InvalidRoundTransition { .. }));
    }

    #[test]
    fn test_failed_is_terminal() {
        let r = RoundState::new(RoundId(1), 32, team(), 16);
        r.update(RoundPhase::Failed, 1).expect("fail");
        assert!(r.update(RoundPhase::Failed, 2).is_err());
        assert!(r.update(RoundPhase::Realtime, 2).is_err());
    }

    #[test]
    fn test_readiness_counts_team_and_resets() {
        let r = RoundState::new(RoundId(1), 32, team(), 16);
        assert!(!r.node_is_ready_for_transition());
        assert!(!r.node_is_ready_for_transition());
        assert!(r.node_is_ready_for_transition());
        // counter reset for the next barrier
        assert!(!r.node_is_ready_for_transition());
        assert!(!r.node_is_ready_for_transition());
        assert!(r.node_is_ready_for_transition());
    }

    #[test]
    fn test_build_round_info_snapshot() {
        let r = RoundState::new(RoundId(7), 64, team(), 16);
        r.update(RoundPhase::Precomputing, 11).expect("advance");
        let info = r.build_round_info();
        assert_eq!(info.id, RoundId(7));
        assert_eq!(info.state, RoundPhase::Precomputing);
        assert_eq!(info.batch_size, 64);
        assert_eq!(info.topology, team());
        assert_eq!(info.timestamp(RoundPhase::Precomputing), 11);
        assert!(info.rsa_signature.is_empty());
    }

    #[test]
    fn test_error_lists() {
        let r = RoundState::new(RoundId(1), 32, team(), 16);
        r.append_error(RoundError {
            id: 1,
            node_id: Some(nid(1)),
            error: "boom".to_string(),
            signature: vec![],
        });
        r.append_client_errors(&[ClientError {
            client_id: vec![1],
            source: vec![],
            error: "client boom".to_string(),
        }]);
        assert_eq!(r.errors().len(), 1);
        assert_eq!(r.client_errors().len(), 1);
    }

    #[test]
    fn test_round_map_duplicate() {
        let map = RoundMap::new();
        map.add_round(RoundId(1), 32, team(), 16).expect("add");
        assert!(matches!(
            map.add_round(RoundId(1), 32, team(), 16),
            Err(StateError::DuplicateRound(_))
        ));
        assert!(map.get_round(RoundId(1)).is_some());
        assert!(map.get_round(RoundId(2)).is_none());
        assert_eq!(map.len(), 1);
    }
}
