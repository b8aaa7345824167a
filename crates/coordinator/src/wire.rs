//! Wire messages shared between the coordinator and polling nodes.
//!
//! `RoundInfo` is the element of the round-update log: a snapshot of round
//! state that nodes and clients replay to learn network progress. Once
//! signed and appended it is immutable. Signatures cover a SHA-256 digest of
//! a deterministic length-prefixed field encoding, never the JSON form, so
//! serialization details cannot invalidate them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use mixnet_common::phase::NUM_PHASES;
use mixnet_common::{NodeId, RoundId, RoundPhase};

/// One entry of the round-update log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub id: RoundId,
    pub update_id: u64,
    pub state: RoundPhase,
    pub batch_size: u32,
    pub topology: Vec<NodeId>,
    /// One nanosecond timestamp slot per round phase.
    pub timestamps: Vec<u64>,
    pub address_space_size: u32,
    #[serde(with = "hex")]
    pub rsa_signature: Vec<u8>,
    #[serde(with = "hex")]
    pub eddsa_signature: Vec<u8>,
}

impl RoundInfo {
    /// The dummy update emitted on first start so that update id 0 can keep
    /// meaning "no updates known".
    pub fn dummy() -> RoundInfo {
        RoundInfo {
            id: RoundId(0),
            update_id: 0,
            state: RoundPhase::Pending,
            batch_size: 0,
            topology: Vec::new(),
            timestamps: vec![0; NUM_PHASES],
            address_space_size: 0,
            rsa_signature: Vec::new(),
            eddsa_signature: Vec::new(),
        }
    }

    /// Digest covered by both signatures.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.id.0.to_be_bytes());
        h.update(self.update_id.to_be_bytes());
        h.update([self.state.index() as u8]);
        h.update(self.batch_size.to_be_bytes());
        h.update((self.topology.len() as u32).to_be_bytes());
        for node in &self.topology {
            h.update(node.as_bytes());
        }
        h.update((self.timestamps.len() as u32).to_be_bytes());
        for ts in &self.timestamps {
            h.update(ts.to_be_bytes());
        }
        h.update(self.address_space_size.to_be_bytes());
        h.finalize().into()
    }

    pub fn timestamp(&self, phase: RoundPhase) -> u64 {
        self.timestamps.get(phase.index()).copied().unwrap_or(0)
    }
}

/// An error reported against a round, signed by its source.
///
/// `id` is the round id the error refers to; 0 means the error is not
/// associated with any round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundError {
    pub id: u64,
    pub node_id: Option<NodeId>,
    pub error: String,
    #[serde(default, with = "hex")]
    pub signature: Vec<u8>,
}

impl RoundError {
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.id.to_be_bytes());
        match &self.node_id {
            Some(id) => {
                h.update([1u8]);
                h.update(id.as_bytes());
            }
            None => h.update([0u8]),
        }
        h.update((self.error.len() as u32).to_be_bytes());
        h.update(self.error.as_bytes());
        h.finalize().into()
    }
}

/// An error one of a round's clients reported through a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    #[serde(default, with = "hex")]
    pub client_id: Vec<u8>,
    #[serde(default, with = "hex")]
    pub source: Vec<u8>,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::id::ID_DATA_LEN;
    use mixnet_common::IdType;

    fn nid(seed: u8) -> NodeId {
        NodeId::new([seed; ID_DATA_LEN], IdType::Node)
    }

    fn sample_info() -> RoundInfo {
        RoundInfo {
            id: RoundId(3),
            update_id: 9,
            state: RoundPhase::Queued,
            batch_size: 32,
            topology: vec![nid(1), nid(2), nid(3)],
            timestamps: vec![1, 2, 3, 4, 0, 0, 0],
            address_space_size: 16,
            rsa_signature: vec![0xaa; 8],
            eddsa_signature: vec![0xbb; 8],
        }
    }

    #[test]
    fn test_serde_roundtrip_is_lossless() {
        let info = sample_info();
        let json = serde_json::to_string(&info).expect("serialize");
        let back: RoundInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(info, back);
    }

    #[test]
    fn test_digest_ignores_signatures() {
        let mut a = sample_info();
        let mut b = sample_info();
        a.rsa_signature = vec![1];
        b.rsa_signature = vec![2];
        b.eddsa_signature = vec![3];
        assert_eq!(a.signing_digest(), b.signing_digest());
    }

    #[test]
    fn test_digest_covers_fields() {
        let base = sample_info();
        let mut changed = sample_info();
        changed.update_id += 1;
        assert_ne!(base.signing_digest(), changed.signing_digest());

        let mut changed = sample_info();
        changed.topology.push(nid(4));
        assert_ne!(base.signing_digest(), changed.signing_digest());

        let mut changed = sample_info();
        changed.timestamps[2] = 99;
        assert_ne!(base.signing_digest(), changed.signing_digest());
    }

    #[test]
    fn test_round_error_digest_distinguishes_source() {
        let a = RoundError { id: 1, node_id: Some(nid(1)), error: "x".into(), signature: vec![] };
        let b = RoundError { id: 1, node_id: None, error: "x".into(), signature: vec![] };
        assert_ne!(a.signing_digest(), b.signing_digest());
    }

    #[test]
    fn test_dummy_has_zeroed_timestamps() {
        let dummy = RoundInfo::dummy();
        assert_eq!(dummy.timestamps, vec![0; NUM_PHASES]);
        assert_eq!(dummy.update_id, 0);
    }
}
