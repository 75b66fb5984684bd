//! Snapshot persistence over the shared key-value database.
//!
//! The engine never owns the database; it writes JSON snapshot blobs under
//! its own prefix through this narrow trait. A memory-backed implementation
//! covers tests and throwaway chains.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::RotaError;

/// Key prefix for engine snapshots in the shared database.
pub const SNAPSHOT_PREFIX: &[u8] = b"rota-";

/// Raw key-value access for snapshot checkpoints.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RotaError>;

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), RotaError>;
}

/// Memory-backed store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RotaError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), RotaError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }
}
