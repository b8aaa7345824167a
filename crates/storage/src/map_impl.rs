//! In-memory map backend.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::info;

use mixnet_common::{NodeId, NodeStatus, RoundId};

use crate::database::{Database, StorageError};
use crate::tables::{
    ActiveNodeRecord, ApplicationRecord, EphemeralLength, GeoBinRecord, NodeMetric, NodeRecord,
    RoundErrorRecord, RoundMetric, StateRecord, TopologyRow,
};

#[derive(Default)]
struct MapState {
    nodes: HashMap<String, NodeRecord>,
    applications: HashMap<u64, ApplicationRecord>,
    node_metrics: Vec<NodeMetric>,
    node_metric_counter: u64,
    round_metrics: HashMap<RoundId, RoundMetric>,
    topologies: Vec<TopologyRow>,
    round_errors: Vec<RoundErrorRecord>,
    round_error_counter: u64,
    states: HashMap<String, String>,
    ephemeral_lengths: HashMap<u8, EphemeralLength>,
    active_nodes: HashMap<String, ActiveNodeRecord>,
    geographic_bins: HashMap<String, u8>,
}

/// [`Database`] implementation with an underlying map, used in tests and
/// single-process deployments.
pub struct MapImpl {
    inner: Mutex<MapState>,
}

impl MapImpl {
    pub fn new() -> MapImpl {
        MapImpl { inner: Mutex::new(MapState::default()) }
    }

    /// Seed country-to-bin mappings, normally done by a migration.
    pub fn seed_bins(&self, bins: &[GeoBinRecord]) {
        let mut m = self.inner.lock();
        for b in bins {
            m.geographic_bins.insert(b.country.clone(), b.bin);
        }
    }

    // Inspection helpers for tests and single-process tooling; the trait
    // itself only exposes what the coordinator needs.

    pub fn get_round_metric(&self, id: RoundId) -> Option<RoundMetric> {
        self.inner.lock().round_metrics.get(&id).cloned()
    }

    pub fn round_metric_count(&self) -> usize {
        self.inner.lock().round_metrics.len()
    }

    pub fn round_errors(&self) -> Vec<RoundErrorRecord> {
        self.inner.lock().round_errors.clone()
    }

    pub fn node_metric_count(&self) -> usize {
        self.inner.lock().node_metrics.len()
    }

    pub fn topology_rows(&self, id: RoundId) -> Vec<TopologyRow> {
        self.inner
            .lock()
            .topologies
            .iter()
            .filter(|row| row.round_id == id)
            .cloned()
            .collect()
    }
}

impl Default for MapImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MapImpl {
    fn upsert_state(&self, state: StateRecord) -> Result<(), StorageError> {
        self.inner.lock().states.insert(state.key, state.value);
        Ok(())
    }

    fn get_state_value(&self, key: &str) -> Result<String, StorageError> {
        self.inner
            .lock()
            .states
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn insert_round_metric(
        &self,
        metric: RoundMetric,
        topology: &[NodeId],
    ) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        let round_id = metric.id;
        m.round_metrics.insert(round_id, metric);
        for (order, node_id) in topology.iter().enumerate() {
            m.topologies.push(TopologyRow {
                node_id: *node_id,
                round_id,
                order: order as u8,
            });
        }
        Ok(())
    }

    fn insert_round_error(&self, round_id: RoundId, error: &str) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        m.round_error_counter += 1;
        let id = m.round_error_counter;
        m.round_errors.push(RoundErrorRecord {
            id,
            round_id,
            error: error.to_string(),
        });
        Ok(())
    }

    fn insert_node_metric(&self, metric: NodeMetric) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        m.node_metric_counter += 1;
        let mut metric = metric;
        metric.id = m.node_metric_counter;
        m.node_metrics.push(metric);
        Ok(())
    }

    fn get_latest_ephemeral_length(&self) -> Result<EphemeralLength, StorageError> {
        self.inner
            .lock()
            .ephemeral_lengths
            .values()
            .max_by_key(|e| e.timestamp)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("ephemeral length".to_string()))
    }

    fn get_ephemeral_lengths(&self) -> Result<Vec<EphemeralLength>, StorageError> {
        Ok(self.inner.lock().ephemeral_lengths.values().cloned().collect())
    }

    fn insert_ephemeral_length(&self, length: EphemeralLength) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        if m.ephemeral_lengths.contains_key(&length.length) {
            return Err(StorageError::AlreadyExists(format!(
                "ephemeral length {}",
                length.length
            )));
        }
        m.ephemeral_lengths.insert(length.length, length);
        Ok(())
    }

    fn get_bins(&self) -> Result<Vec<GeoBinRecord>, StorageError> {
        Ok(self
            .inner
            .lock()
            .geographic_bins
            .iter()
            .map(|(country, bin)| GeoBinRecord { country: country.clone(), bin: *bin })
            .collect())
    }

    fn insert_application(
        &self,
        application: ApplicationRecord,
        unregistered_node: NodeRecord,
    ) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        if m.nodes.contains_key(&unregistered_node.code) {
            return Err(StorageError::AlreadyExists(format!(
                "registration code {}",
                unregistered_node.code
            )));
        }
        info!(code = %unregistered_node.code, "adding node registration code");
        m.applications.insert(application.id, application);
        m.nodes.insert(unregistered_node.code.clone(), unregistered_node);
        Ok(())
    }

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
    ) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        let node = m
            .nodes
            .get_mut(code)
            .ok_or_else(|| StorageError::NotFound(format!("registration code {code}")))?;
        node.id = Some(id);
        node.salt = salt.to_vec();
        node.server_address = server_address.to_string();
        node.node_certificate = server_cert.to_string();
        node.gateway_address = gateway_address.to_string();
        node.gateway_certificate = gateway_cert.to_string();
        node.public_key = public_key.to_string();
        node.status = NodeStatus::Active;
        Ok(())
    }

    fn update_node_addresses(
        &self,
        id: NodeId,
        node_address: &str,
        gateway_address: &str,
    ) -> Result<(), StorageError> {
        let mut m = self.inner.lock();
        let node = m
            .nodes
            .values_mut()
            .find(|n| n.id == Some(id))
            .ok_or_else(|| StorageError::NotFound(format!("node {id}")))?;
        node.server_address = node_address.to_string();
        node.gateway_address = gateway_address.to_string();
        Ok(())
    }

    fn get_node(&self, code: &str) -> Result<NodeRecord, StorageError> {
        self.inner
            .lock()
            .nodes
            .get(code)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("registration code {code}")))
    }

    fn get_node_by_id(&self, id: NodeId) -> Result<NodeRecord, StorageError> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|n| n.id == Some(id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("node {id}")))
    }

    fn get_nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    fn get_nodes_by_status(&self, status: NodeStatus) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self
            .inner
            .lock()
            .nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect())
    }

    fn get_active_nodes(&self) -> Result<Vec<ActiveNodeRecord>, StorageError> {
        Ok(self.inner.lock().active_nodes.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{ROUND_ID_KEY, UPDATE_ID_KEY};
    use mixnet_common::id::ID_DATA_LEN;
    use mixnet_common::IdType;

    fn nid(seed: u8) -> NodeId {
        NodeId::new([seed; ID_DATA_LEN], IdType::Node)
    }

    fn seeded() -> MapImpl {
        let m = MapImpl::new();
        m.insert_application(
            ApplicationRecord { id: 1, ..Default::default() },
            NodeRecord::unregistered("code-1", "0", 1),
        )
        .expect("insert application");
        m
    }

    #[test]
    fn test_state_upsert_and_get() {
        let m = MapImpl::new();
        assert!(m.get_state_value(UPDATE_ID_KEY).is_err());

        m.upsert_state(StateRecord { key: UPDATE_ID_KEY.to_string(), value: "4".to_string() })
            .expect("upsert");
        assert_eq!(m.get_state_value(UPDATE_ID_KEY).expect("get"), "4");

        m.upsert_state(StateRecord { key: UPDATE_ID_KEY.to_string(), value: "5".to_string() })
            .expect("upsert again");
        assert_eq!(m.get_state_value(UPDATE_ID_KEY).expect("get"), "5");
        assert!(m.get_state_value(ROUND_ID_KEY).is_err());
    }

    #[test]
    fn test_register_node_flow() {
        let m = seeded();

        // unknown code is rejected
        assert!(m
            .register_node(nid(1), &[1, 2], "bogus", "a:1", "", "a:2", "", "ab")
            .is_err());

        m.register_node(nid(1), &[1, 2], "code-1", "a:1", "cert", "a:2", "gwcert", "ab")
            .expect("register");

        let rec = m.get_node("code-1").expect("get by code");
        assert_eq!(rec.id, Some(nid(1)));
        assert_eq!(rec.server_address, "a:1");

        let by_id = m.get_node_by_id(nid(1)).expect("get by id");
        assert_eq!(by_id.code, "code-1");

        // duplicate code insert rejected
        assert!(m
            .insert_application(
                ApplicationRecord { id: 2, ..Default::default() },
                NodeRecord::unregistered("code-1", "1", 2),
            )
            .is_err());
    }

    #[test]
    fn test_update_node_addresses() {
        let m = seeded();
        m.register_node(nid(1), &[], "code-1", "a:1", "", "a:2", "", "")
            .expect("register");
        m.update_node_addresses(nid(1), "b:1", "b:2").expect("update");
        let rec = m.get_node_by_id(nid(1)).expect("get");
        assert_eq!(rec.server_address, "b:1");
        assert_eq!(rec.gateway_address, "b:2");
        assert!(m.update_node_addresses(nid(9), "c:1", "c:2").is_err());
    }

    #[test]
    fn test_round_metric_with_topology() {
        let m = MapImpl::new();
        let topology = [nid(1), nid(2), nid(3)];
        m.insert_round_metric(
            RoundMetric {
                id: RoundId(7),
                precomp_start: 10,
                precomp_end: 20,
                realtime_start: 30,
                realtime_end: 40,
                batch_size: 32,
            },
            &topology,
        )
        .expect("insert metric");

        let inner = m.inner.lock();
        assert!(inner.round_metrics.contains_key(&RoundId(7)));
        assert_eq!(inner.topologies.len(), 3);
        assert_eq!(inner.topologies[2].order, 2);
        assert_eq!(inner.topologies[2].node_id, nid(3));
    }

    #[test]
    fn test_round_errors_accumulate() {
        let m = MapImpl::new();
        m.insert_round_error(RoundId(1), "first").expect("insert");
        m.insert_round_error(RoundId(1), "second").expect("insert");
        let inner = m.inner.lock();
        assert_eq!(inner.round_errors.len(), 2);
        assert_eq!(inner.round_errors[1].id, 2);
    }

    #[test]
    fn test_ephemeral_lengths() {
        let m = MapImpl::new();
        assert!(m.get_latest_ephemeral_length().is_err());
        m.insert_ephemeral_length(EphemeralLength { length: 8, timestamp: 100 })
            .expect("insert");
        m.insert_ephemeral_length(EphemeralLength { length: 16, timestamp: 200 })
            .expect("insert");
        assert!(m
            .insert_ephemeral_length(EphemeralLength { length: 8, timestamp: 300 })
            .is_err());
        assert_eq!(m.get_latest_ephemeral_length().expect("latest").length, 16);
        assert_eq!(m.get_ephemeral_lengths().expect("all").len(), 2);
    }

    #[test]
    fn test_nodes_by_status() {
        let m = seeded();
        m.insert_application(
            ApplicationRecord { id: 2, ..Default::default() },
            NodeRecord::unregistered("code-2", "1", 2),
        )
        .expect("insert");
        m.register_node(nid(1), &[], "code-1", "a:1", "", "a:2", "", "")
            .expect("register");

        // only code-1 was moved to Active by registration with a fresh row
        let active = m.get_nodes_by_status(NodeStatus::Active).expect("query");
        assert_eq!(active.len(), 2); // unregistered rows default to Active too
        assert!(m.get_nodes_by_status(NodeStatus::Banned).expect("query").is_empty());
    }

    #[test]
    fn test_seed_and_get_bins() {
        let m = MapImpl::new();
        m.seed_bins(&[
            GeoBinRecord { country: "DE".to_string(), bin: 2 },
            GeoBinRecord { country: "US".to_string(), bin: 0 },
        ]);
        let mut bins = m.get_bins().expect("bins");
        bins.sort_by(|a, b| a.country.cmp(&b.country));
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].country, "DE");
        assert_eq!(bins[0].bin, 2);
    }
}
