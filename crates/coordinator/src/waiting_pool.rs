//! The staging pool of nodes eligible to be teamed.
//!
//! Owned by the scheduler loop, so no internal locking. Two partitions:
//! online (the default, and the only one counted or extracted from) and
//! offline for inactive nodes. Insertion order is stable, which is what
//! makes team extraction deterministic when random ordering is off.

use std::sync::Arc;

use mixnet_common::NodeId;

use crate::node_state::NodeState;

#[derive(Default)]
pub struct WaitingPool {
    online: Vec<Arc<NodeState>>,
    offline: Vec<Arc<NodeState>>,
}

impl WaitingPool {
    pub fn new() -> WaitingPool {
        WaitingPool::default()
    }

    fn position(list: &[Arc<NodeState>], id: NodeId) -> Option<usize> {
        list.iter().position(|n| n.id() == id)
    }

    /// Add a node to the online partition. Idempotent on identity: a node
    /// already present in either partition is left where it is.
    pub fn add(&mut self, node: Arc<NodeState>) {
        let id = node.id();
        if Self::position(&self.online, id).is_some()
            || Self::position(&self.offline, id).is_some()
        {
            return;
        }
        self.online.push(node);
    }

    /// Move a node from the offline partition to the online one. A node in
    /// neither partition is simply added online.
    pub fn set_node_online(&mut self, node: Arc<NodeState>) {
        if let Some(i) = Self::position(&self.offline, node.id()) {
            let node = self.offline.remove(i);
            self.online.push(node);
            return;
        }
        self.add(node);
    }

    /// Move a node from the online partition to the offline one.
    pub fn set_node_offline(&mut self, node: Arc<NodeState>) {
        if let Some(i) = Self::position(&self.online, node.id()) {
            let node = self.online.remove(i);
            self.offline.push(node);
        } else if Self::position(&self.offline, node.id()).is_none() {
            self.offline.push(node);
        }
    }

    /// Remove a node from both partitions.
    pub fn ban(&mut self, id: NodeId) {
        if let Some(i) = Self::position(&self.online, id) {
            self.online.remove(i);
        }
        if let Some(i) = Self::position(&self.offline, id) {
            self.offline.remove(i);
        }
    }

    /// Size of the online partition only.
    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Remove and return exactly `n` online nodes in insertion order.
    /// Extracted nodes are no longer in the pool; they re-enter on their
    /// next waiting report after the round ends.
    pub fn extract_team(&mut self, n: usize) -> Vec<Arc<NodeState>> {
        self.online.drain(..n.min(self.online.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::id::ID_DATA_LEN;
    use mixnet_common::IdType;

    fn node(seed: u8) -> Arc<NodeState> {
        let map = crate::node_state::NodeMap::new();
        let id = NodeId::new([seed; ID_DATA_LEN], IdType::Node);
        map.add_node(id, "0", "", "").expect("add node");
        map.get_node(id).expect("get node")
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut pool = WaitingPool::new();
        let n = node(1);
        pool.add(Arc::clone(&n));
        pool.add(n);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_extract_team_preserves_insertion_order() {
        let mut pool = WaitingPool::new();
        let nodes: Vec<_> = (1..=5).map(node).collect();
        for n in &nodes {
            pool.add(Arc::clone(n));
        }

        let team = pool.extract_team(3);
        let ids: Vec<NodeId> = team.iter().map(|n| n.id()).collect();
        let expected: Vec<NodeId> = nodes[..3].iter().map(|n| n.id()).collect();
        assert_eq!(ids, expected);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_offline_partition_not_counted() {
        let mut pool = WaitingPool::new();
        let a = node(1);
        let b = node(2);
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&b));
        pool.set_node_offline(Arc::clone(&a));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.offline_len(), 1);

        pool.set_node_online(a);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.offline_len(), 0);
    }

    #[test]
    fn test_set_online_unknown_node_adds() {
        let mut pool = WaitingPool::new();
        pool.set_node_online(node(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_ban_removes_from_both_partitions() {
        let mut pool = WaitingPool::new();
        let a = node(1);
        let b = node(2);
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&b));
        pool.set_node_offline(Arc::clone(&b));

        pool.ban(a.id());
        pool.ban(b.id());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.offline_len(), 0);
    }
}
