//! Disabled-nodes list polling.
//!
//! Operators can park nodes in a newline-separated list file. The poller
//! re-reads it on an interval and folds the ids into the prune set as
//! kept-but-stale entries: a disabled node stays visible in the NDF but is
//! never marked active, and it is never fully pruned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mixnet_common::NodeId;

use crate::network_state::NetworkState;

/// Parse the disabled-nodes list. Unparsable lines are skipped with a
/// warning; a missing file reads as an empty list.
pub fn read_disabled_list(path: &Path) -> Vec<NodeId> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "could not read disabled nodes list");
            return Vec::new();
        }
    };

    let mut ids = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match NodeId::from_hex(line) {
            Ok(id) => ids.push(id),
            Err(err) => warn!(%line, %err, "skipping invalid disabled node id"),
        }
    }
    ids
}

/// Poll the disabled-nodes list until the quit channel closes or fires.
pub async fn poll_disabled_nodes(
    state: Arc<NetworkState>,
    path: PathBuf,
    interval: Duration,
    mut quit: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ids = read_disabled_list(&path);
                debug!(count = ids.len(), "refreshed disabled nodes list");
                state.set_disabled_nodes(ids);
            }
            _ = quit.recv() => return,
        }
    }
}
