//! Per-transaction, per-table bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

use mvkv_index::LeafHandle;
use mvkv_types::Tid;

use crate::range::AbsentRangeSet;
use crate::record::{HeadRef, VersionRecord};

/// Raw pointer to a record observed by a read.
///
/// Valid for as long as the owning transaction's pin guard lives: records
/// are only destroyed after a grace period, and the pin was taken before the
/// pointer was captured.
pub(crate) struct RecordPtr(NonNull<VersionRecord>);

impl RecordPtr {
    pub(crate) fn new(rec: &VersionRecord) -> Self {
        Self(NonNull::from(rec))
    }

    /// # Safety
    ///
    /// The transaction's pin guard must still be held.
    pub(crate) unsafe fn get(&self) -> &VersionRecord {
        // Safety: forwarded to the caller.
        unsafe { self.0.as_ref() }
    }
}

impl std::fmt::Debug for RecordPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordPtr({:p})", self.0)
    }
}

/// One read-set entry: what was observed, and where.
#[derive(Debug)]
pub(crate) struct ReadRecord {
    /// Tid the value was written at.
    pub tid: Tid,
    /// Snapshot of the bytes read (empty = tombstone).
    pub value: Vec<u8>,
    /// The record the read was served from.
    pub record: RecordPtr,
}

/// Result of consulting the transaction's own buffers before the index.
pub(crate) enum LocalHit<'a> {
    /// The key is in the write set; the buffered bytes win.
    Buffered(&'a [u8]),
    /// The key was read before; the recorded snapshot wins.
    Read(&'a ReadRecord),
}

/// Per-table transaction context: read set, write set, absent ranges, and
/// scanned-leaf versions.
#[derive(Debug, Default)]
pub(crate) struct TxnContext {
    pub read_set: HashMap<Box<[u8]>, ReadRecord>,
    /// Ordered so commit walks keys in the canonical locking order.
    pub write_set: BTreeMap<Box<[u8]>, Box<[u8]>>,
    pub absent_ranges: AbsentRangeSet,
    /// Leaf version observed at scan time (low-level scan mode only).
    pub leaf_scans: HashMap<LeafHandle<HeadRef>, u64>,
}

impl TxnContext {
    /// Look `key` up in the transaction's own buffers, write set first.
    pub fn local_search(&self, key: &[u8]) -> Option<LocalHit<'_>> {
        if let Some(buffered) = self.write_set.get(key) {
            return Some(LocalHit::Buffered(buffered));
        }
        self.read_set.get(key).map(LocalHit::Read)
    }

    /// Record a leaf version observed during a scan. The first observation
    /// wins; commit revalidates against it.
    pub fn record_leaf_scan(&mut self, leaf: LeafHandle<HeadRef>, version: u64) {
        self.leaf_scans.entry(leaf).or_insert(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_set_shadows_read_set() {
        let mut ctx = TxnContext::default();
        let rec = VersionRecord::alloc_first(8);
        ctx.read_set.insert(
            Box::from(&b"k"[..]),
            ReadRecord {
                tid: Tid::new(3),
                value: b"old".to_vec(),
                record: RecordPtr::new(&rec),
            },
        );
        assert!(matches!(
            ctx.local_search(b"k"),
            Some(LocalHit::Read(rr)) if rr.value == b"old"
        ));

        ctx.write_set.insert(Box::from(&b"k"[..]), Box::from(&b"new"[..]));
        assert!(matches!(
            ctx.local_search(b"k"),
            Some(LocalHit::Buffered(b)) if b == b"new"
        ));
        assert!(ctx.local_search(b"other").is_none());
    }
}
