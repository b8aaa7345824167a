//! The durable side of the round-update log.
//!
//! Entries arrive here strictly in update-id order from the single adder
//! task owned by the network state; readers are lock-free in the sense that
//! they only ever see fully inserted entries and never block appends for
//! long.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::wire::RoundInfo;

/// Ordered store of accepted round updates, readable by update id.
#[derive(Default)]
pub struct UpdateLog {
    updates: RwLock<BTreeMap<u64, Arc<RoundInfo>>>,
    last_id: AtomicU64,
}

impl UpdateLog {
    pub fn new() -> UpdateLog {
        UpdateLog::default()
    }

    /// Insert an update. The adder task guarantees in-order arrival, but
    /// `last_id` advances with a max so a late-but-in-order insert can never
    /// move it backwards.
    pub fn add_round_info(&self, info: Arc<RoundInfo>) {
        let id = info.update_id;
        self.updates.write().insert(id, info);
        self.last_id.fetch_max(id, Ordering::AcqRel);
    }

    /// All updates with id strictly greater than `since`, in id order.
    pub fn get_updates(&self, since: u64) -> Vec<Arc<RoundInfo>> {
        let Some(first) = since.checked_add(1) else {
            return Vec::new();
        };
        self.updates
            .read()
            .range(first..)
            .map(|(_, info)| Arc::clone(info))
            .collect()
    }

    pub fn get_update(&self, id: u64) -> Option<Arc<RoundInfo>> {
        self.updates.read().get(&id).cloned()
    }

    /// Last durably accepted update id; 0 when nothing has been accepted.
    pub fn last_update_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }
}
