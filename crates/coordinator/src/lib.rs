//! # Mixnet Permissioning Coordinator
//!
//! The authoritative control plane of the mixnet: admits nodes and their
//! co-located gateways, publishes the signed network definition file (NDF),
//! and schedules nodes into teams that execute mixing rounds, driving each
//! round through its precomputation, realtime and completion lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         COORDINATOR                              │
//! │                                                                  │
//! │  poll endpoint ──enqueue──▶ scheduler loop ──▶ update handler    │
//! │       │                        │                    │            │
//! │       │                   waiting pool         node map /        │
//! │       │                        │               round map         │
//! │       │                        ▼                    │            │
//! │       │                  round starter ◀────────────┘            │
//! │       │                        │                                 │
//! │       ▼                        ▼                                 │
//! │  NDF publisher          round-update log (signed, gap-free)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! External polls become [`node_state::UpdateNotification`]s on a bounded
//! channel. The scheduler loop dequeues them one at a time into the
//! node-update handler, which mutates the shared
//! [`network_state::NetworkState`] and may append signed
//! [`wire::RoundInfo`] entries to the update log. When the waiting pool
//! fills, a team is extracted and the round starter brings the round to
//! life.

pub mod api;
pub mod cli;
pub mod disabled;
pub mod error;
pub mod ndf;
pub mod network_state;
pub mod node_metrics;
pub mod node_state;
pub mod node_updates;
pub mod poll;
pub mod registration;
pub mod round_state;
pub mod scheduler;
pub mod starter;
pub mod tracker;
pub mod update_log;
pub mod waiting_pool;
pub mod wire;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::StateError;
pub use network_state::NetworkState;
pub use tracker::RoundTracker;

use mixnet_common::version::Version;
use mixnet_storage::Storage;

/// Everything the HTTP endpoints need, constructed once at startup.
pub struct ServerContext {
    pub state: Arc<NetworkState>,
    pub storage: Storage,
    pub min_gateway_version: Option<Version>,
    pub min_server_version: Option<Version>,
    pub client_limiter: registration::RateLimiter,
}

/// Nanoseconds since the Unix epoch, the timestamp unit used throughout
/// round state and the NDF.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
