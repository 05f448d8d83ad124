//! Transactional tables: named key spaces backed by the versioned index.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mvkv_index::LeafMap;

use crate::record::HeadRef;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// One key space. The index maps keys to chain-head cells; everything
/// version-related lives in the chains themselves.
///
/// Tables are identified by a process-unique id; commit acquires write locks
/// in `(table id, key)` order across all tables a transaction touched, which
/// is what rules out lock-order deadlocks.
pub struct TxnTable {
    id: u64,
    name: String,
    map: LeafMap<HeadRef>,
}

impl TxnTable {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "mvkv.table", id, name, "table created");
        Arc::new(Self {
            id,
            name,
            map: LeafMap::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn map(&self) -> &LeafMap<HeadRef> {
        &self.map
    }

    /// Whether the index currently holds an entry for `key` (it may still be
    /// a tombstone chain). Diagnostics and tests.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.map.find(key).is_some()
    }

    /// Number of index entries, tombstones included. Diagnostics and tests.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.map.len()
    }
}

impl std::fmt::Debug for TxnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
