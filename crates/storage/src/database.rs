//! The storage capability trait.

use thiserror::Error;

use mixnet_common::{NodeId, NodeStatus, RoundId};

use crate::tables::{
    ActiveNodeRecord, ApplicationRecord, EphemeralLength, GeoBinRecord, NodeMetric, NodeRecord,
    RoundMetric, StateRecord,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Everything the coordinator persists, as one interface.
///
/// Metric and error inserts are best-effort from the caller's point of view:
/// the scheduler logs and swallows failures rather than aborting.
pub trait Database: Send + Sync {
    // ── permissioning state ──
    fn upsert_state(&self, state: StateRecord) -> Result<(), StorageError>;
    fn get_state_value(&self, key: &str) -> Result<String, StorageError>;

    fn insert_round_metric(
        &self,
        metric: RoundMetric,
        topology: &[NodeId],
    ) -> Result<(), StorageError>;
    fn insert_round_error(&self, round_id: RoundId, error: &str) -> Result<(), StorageError>;
    fn insert_node_metric(&self, metric: NodeMetric) -> Result<(), StorageError>;

    fn get_latest_ephemeral_length(&self) -> Result<EphemeralLength, StorageError>;
    fn get_ephemeral_lengths(&self) -> Result<Vec<EphemeralLength>, StorageError>;
    fn insert_ephemeral_length(&self, length: EphemeralLength) -> Result<(), StorageError>;

    fn get_bins(&self) -> Result<Vec<GeoBinRecord>, StorageError>;

    // ── nodes ──
    fn insert_application(
        &self,
        application: ApplicationRecord,
        unregistered_node: NodeRecord,
    ) -> Result<(), StorageError>;

    /// Bind a node identity to its one-time registration code.
    #[allow(clippy::too_many_arguments)]
    fn register_node(
        &self,
        id: NodeId,
        salt: &[u8],
        code: &str,
        server_address: &str,
        server_cert: &str,
        gateway_address: &str,
        gateway_cert: &str,
        public_key: &str,
    ) -> Result<(), StorageError>;

    fn update_node_addresses(
        &self,
        id: NodeId,
        node_address: &str,
        gateway_address: &str,
    ) -> Result<(), StorageError>;

    fn get_node(&self, code: &str) -> Result<NodeRecord, StorageError>;
    fn get_node_by_id(&self, id: NodeId) -> Result<NodeRecord, StorageError>;
    fn get_nodes(&self) -> Result<Vec<NodeRecord>, StorageError>;
    fn get_nodes_by_status(&self, status: NodeStatus) -> Result<Vec<NodeRecord>, StorageError>;
    fn get_active_nodes(&self) -> Result<Vec<ActiveNodeRecord>, StorageError>;
}
