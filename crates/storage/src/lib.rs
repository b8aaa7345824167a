//! Persistence layer for the mixnet permissioning service.
//!
//! A single capability trait ([`Database`]) covers everything the
//! coordinator persists: the key-value state table (round and update
//! counters, the elliptic key), node application records, round and node
//! metrics, round errors, ephemeral id lengths, and geographic bins.
//!
//! The backend is selected at construction time. This crate ships an
//! in-memory map backend ([`MapImpl`]) which doubles as the test fixture;
//! an ORM-backed implementation slots in behind the same trait.

pub mod database;
pub mod map_impl;
pub mod tables;

use std::ops::Deref;
use std::sync::Arc;

pub use database::{Database, StorageError};
pub use map_impl::MapImpl;
pub use tables::*;

/// Handle to the selected storage backend. Cheap to clone; all callers
/// share one backend instance.
#[derive(Clone)]
pub struct Storage(Arc<dyn Database>);

impl Storage {
    /// Wrap an explicit backend.
    pub fn new(backend: Arc<dyn Database>) -> Storage {
        Storage(backend)
    }

    /// Construct storage over the in-memory map backend.
    pub fn new_map() -> Storage {
        Storage(Arc::new(MapImpl::new()))
    }
}

impl Deref for Storage {
    type Target = dyn Database;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
