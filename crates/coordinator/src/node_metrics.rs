//! Node activity tracking.
//!
//! A background task that, once per interval, commits a poll-count metric
//! row per node, recomputes the prune set from poll staleness, and
//! republishes the NDF. Nodes that stopped polling disappear from the
//! published NDF; disabled nodes stay as stale entries via the merge in
//! the network state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mixnet_common::{NodeId, NodeStatus};
use mixnet_storage::NodeMetric;

use crate::network_state::NetworkState;
use crate::now_nanos;

/// Run the tracker until the quit channel closes or fires.
pub async fn track_node_metrics(
    state: Arc<NetworkState>,
    interval: Duration,
    stale_after: Duration,
    mut quit: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // consume the immediate first tick so the first window is full-length
    ticker.tick().await;
    let mut window_start = now_nanos();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let window_end = now_nanos();
                record_window(&state, window_start, window_end, stale_after);
                window_start = window_end;
            }
            _ = quit.recv() => return,
        }
    }
}

/// Commit one monitoring window: per-node metric rows, a fresh prune set,
/// and an NDF republication.
pub fn record_window(
    state: &Arc<NetworkState>,
    window_start: u64,
    window_end: u64,
    stale_after: Duration,
) {
    let stale_nanos = stale_after.as_nanos() as u64;
    let mut pruned: HashMap<NodeId, bool> = HashMap::new();

    for node in state.node_map().get_node_states() {
        let num_polls = node.take_num_polls();
        let metric = NodeMetric {
            id: 0,
            node_id: node.id(),
            start_time: window_start,
            end_time: window_end,
            num_polls,
        };
        if let Err(err) = state.storage().insert_node_metric(metric) {
            warn!(node = %node.id(), %err, "could not insert node metric");
        }

        if node.status() == NodeStatus::Banned {
            pruned.insert(node.id(), true);
            continue;
        }
        let last_poll = node.last_poll();
        if last_poll == 0 || window_end.saturating_sub(last_poll) > stale_nanos {
            pruned.insert(node.id(), true);
        }
    }

    debug!(pruned = pruned.len(), "recomputed prune set from poll staleness");
    state.set_pruned_nodes(pruned);

    if let Err(err) = state.update_output_ndf() {
        warn!(%err, "could not republish NDF after metric window");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndf::{EntryStatus, GatewayEntry, NetworkDefinition, NodeEntry};
    use mixnet_common::crypto;
    use mixnet_common::id::ID_DATA_LEN;
    use mixnet_common::IdType;
    use mixnet_storage::Storage;

    fn nid(seed: u8) -> NodeId {
        NodeId::new([seed; ID_DATA_LEN], IdType::Node)
    }

    #[tokio::test]
    async fn test_stale_nodes_get_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = crypto::generate_rsa_key(crypto::RSA_KEY_BITS).expect("rsa key");
        let state = NetworkState::new(
            key,
            16,
            dir.path().join("ndf.json"),
            dir.path().join("partial.b64"),
            HashMap::new(),
            Storage::new_map(),
        )
        .await
        .expect("state");

        for seed in [1u8, 2] {
            state.node_map().add_node(nid(seed), "0", "", "").expect("add node");
        }
        let mut ndf = NetworkDefinition::default();
        for seed in [1u8, 2] {
            ndf.append_node(
                NodeEntry { id: Some(nid(seed)), ..Default::default() },
                GatewayEntry {
                    id: Some(nid(seed).with_type(IdType::Gateway)),
                    ..Default::default()
                },
            );
        }
        state.update_internal_ndf(ndf);

        // node 1 polled recently, node 2 never did
        let fresh = state.node_map().get_node(nid(1)).expect("node");
        fresh.increment_num_polls();
        fresh.set_last_poll(now_nanos());

        record_window(&state, 0, now_nanos(), Duration::from_secs(600));

        assert!(!state.is_pruned(nid(1)));
        assert!(state.is_pruned(nid(2)));

        let full = state.get_full_ndf();
        assert_eq!(full.ndf.nodes.len(), 1);
        assert_eq!(full.ndf.nodes[0].id, Some(nid(1)));
        assert_eq!(full.ndf.nodes[0].status, EntryStatus::Active);

        // the window reset the poll counter
        assert_eq!(fresh.num_polls(), 0);
    }
}
