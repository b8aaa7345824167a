//! Row types for the persistence layer.
//!
//! Timestamps are nanoseconds since the Unix epoch, matching the round
//! timestamp vectors on the wire.

use serde::{Deserialize, Serialize};

use mixnet_common::{NodeId, NodeStatus, RoundId};

/// Key-value store used for persisting permissioning state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: String,
    pub value: String,
}

/// Keys in the state table that the coordinator maintains internally.
pub const UPDATE_ID_KEY: &str = "UpdateId";
pub const ROUND_ID_KEY: &str = "RoundId";
pub const ELLIPTIC_KEY: &str = "EllipticKey";

/// A node operator's application record. One application owns one node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub location: String,
    pub geo_bin: String,
    pub gps_location: String,
    pub team: String,
    pub network: String,
}

/// A registered (or registerable) node. The one-time registration code is
/// the primary key; `id` stays unset until the operator registers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub code: String,
    /// Ordering tag consumed by the teaming algorithm.
    pub sequence: String,
    pub id: Option<NodeId>,
    pub salt: Vec<u8>,
    pub server_address: String,
    pub gateway_address: String,
    /// Node TLS certificate, PEM text.
    pub node_certificate: String,
    /// Gateway TLS certificate, PEM text.
    pub gateway_certificate: String,
    /// Hex of the node's Ed25519 public key, used to authenticate polls.
    pub public_key: String,
    pub date_registered: u64,
    pub last_active: u64,
    pub status: NodeStatus,
    pub application_id: u64,
}

impl NodeRecord {
    /// An unregistered row holding only the code and ordering tag.
    pub fn unregistered(code: &str, sequence: &str, application_id: u64) -> NodeRecord {
        NodeRecord {
            code: code.to_string(),
            sequence: sequence.to_string(),
            id: None,
            salt: Vec::new(),
            server_address: String::new(),
            gateway_address: String::new(),
            node_certificate: String::new(),
            gateway_certificate: String::new(),
            public_key: String::new(),
            date_registered: 0,
            last_active: 0,
            status: NodeStatus::Active,
            application_id,
        }
    }
}

/// One monitoring window of poll activity for a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub id: u64,
    pub node_id: NodeId,
    pub start_time: u64,
    pub end_time: u64,
    pub num_polls: u64,
}

/// Metrics committed when a round completes or fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMetric {
    pub id: RoundId,
    pub precomp_start: u64,
    pub precomp_end: u64,
    pub realtime_start: u64,
    pub realtime_end: u64,
    pub batch_size: u32,
}

/// A node's ordinal position within a recorded round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRow {
    pub node_id: NodeId,
    pub round_id: RoundId,
    pub order: u8,
}

/// An error recorded against a failed round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundErrorRecord {
    pub id: u64,
    pub round_id: RoundId,
    pub error: String,
}

/// Wallet-to-node binding for nodes considered active by the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNodeRecord {
    pub wallet_address: String,
    pub id: NodeId,
}

/// Country to geographic bin mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoBinRecord {
    pub country: String,
    pub bin: u8,
}

/// Validity period of an ephemeral id length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralLength {
    pub length: u8,
    pub timestamp: u64,
}
