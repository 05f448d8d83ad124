//! Protocol P1: globally consistent TIDs from a single counter.
//!
//! One process-wide atomic counter hands out commit TIDs; a second word,
//! `last_consistent`, trails it and marks the newest TID whose transaction
//! has fully resolved. Snapshots read at `last_consistent`, so a snapshot
//! never observes a half-finished commit.
//!
//! Every commit spills history (versions are never overwritten in place),
//! so chains grow on every update; the spill hook truncates any chain that
//! exceeds the configured cap and hands the severed tail to the reclaimer.
//! Tombstones are collected by a deferred task gated on a grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mvkv_types::Tid;

use crate::align::CacheAligned;
use crate::counters;
use crate::protocol::Protocol;
use crate::reclaim::{PinGuard, Reclaimer};
use crate::record::{HeadRef, VersionRecord};
use crate::table::TxnTable;

/// Tuning knobs for the global-TID protocol.
#[derive(Debug, Clone, Copy)]
pub struct GlobalTidConfig {
    /// Chains longer than this are truncated when they spill.
    pub max_chain_length: usize,
}

impl Default for GlobalTidConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 10,
        }
    }
}

/// Runtime state of protocol P1.
pub struct GlobalTid {
    cfg: GlobalTidConfig,
    reclaimer: Arc<Reclaimer>,
    /// Monotone commit-TID source.
    global_tid: CacheAligned<AtomicU64>,
    /// Newest TID whose transaction has resolved; snapshots read here.
    last_consistent: CacheAligned<AtomicU64>,
}

/// Per-transaction state: the snapshot captured at begin.
#[derive(Debug)]
pub struct GlobalTxnHandle {
    snapshot: Tid,
}

impl GlobalTid {
    #[must_use]
    pub fn new(cfg: GlobalTidConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            reclaimer: Reclaimer::new(),
            global_tid: CacheAligned::new(AtomicU64::new(Tid::MIN.get())),
            last_consistent: CacheAligned::new(AtomicU64::new(Tid::MIN.get())),
        })
    }

    /// Newest TID visible to fresh snapshots.
    #[must_use]
    pub fn last_consistent_tid(&self) -> Tid {
        Tid::new(self.last_consistent.load(Ordering::Acquire))
    }

    /// Collect a tombstone chain whose grace period has passed: remove the
    /// index entry and retire the chain, unless the key was written again in
    /// the meantime.
    fn try_collect_tombstone(table: &TxnTable, key: &[u8], cell: &HeadRef) {
        let guard = crossbeam_epoch::pin();
        loop {
            let head_shared = cell.load(&guard);
            let Some(head) = (unsafe { head_shared.as_ref() }) else {
                return;
            };
            head.lock();
            if cell.load(&guard).as_raw() != head_shared.as_raw() {
                // Replaced while we were locking; retry against the new head.
                head.unlock();
                continue;
            }
            if !head.is_enqueued() {
                head.unlock();
                return;
            }
            head.set_enqueued(false);
            if !head.is_latest() || head.value_len() != 0 {
                // Rewritten since the delete; nothing to collect.
                head.unlock();
                return;
            }
            table
                .map()
                .remove_if(key, |stored| Arc::ptr_eq(stored, cell));
            cell.clear();
            head.set_latest(false);
            head.mark_deleting();
            head.unlock();
            // Safety: the chain is unlinked from the index and the cell.
            unsafe { guard.defer_destroy(head_shared) };
            let tail = head.next(&guard);
            let released = 1 + VersionRecord::release_chain(tail, &guard);
            counters::record_truncation(released);
            tracing::debug!(
                target: "mvkv.gc",
                table = table.name(),
                released,
                "tombstone chain collected"
            );
            return;
        }
    }
}

impl Protocol for GlobalTid {
    type TxnHandle = GlobalTxnHandle;
    type CommitGuard<'p>
        = ()
    where
        Self: 'p;

    fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    fn begin_txn(&self) -> GlobalTxnHandle {
        GlobalTxnHandle {
            snapshot: self.last_consistent_tid(),
        }
    }

    fn end_txn(&self, _handle: &mut GlobalTxnHandle) {}

    fn consistent_snapshot_tid(&self, handle: &GlobalTxnHandle) -> (bool, Tid) {
        (true, handle.snapshot)
    }

    fn can_read_tid(&self, _handle: &GlobalTxnHandle, _t: Tid) -> bool {
        // The counter is totally ordered; any committed TID is readable.
        true
    }

    fn can_overwrite_record_tid(&self, _prev: Tid, _cur: Tid) -> bool {
        // P1 never overwrites in place; every commit spills history.
        false
    }

    fn commit_begin<'p>(&'p self, _handle: &GlobalTxnHandle) {}

    fn gen_commit_tid(
        &self,
        _handle: &mut GlobalTxnHandle,
        _permit: &mut (),
        dep_max: Tid,
    ) -> Tid {
        let tid = Tid::new(self.global_tid.fetch_add(1, Ordering::AcqRel) + 1);
        debug_assert!(
            tid > dep_max,
            "global counter fell behind an observed tid ({tid} <= {dep_max})"
        );
        tid
    }

    fn on_record_spill(
        &self,
        _handle: &GlobalTxnHandle,
        pin: &PinGuard,
        _cell: &HeadRef,
        head: &VersionRecord,
    ) {
        let guard = pin.guard();
        if head.chain_len(guard) <= self.cfg.max_chain_length {
            return;
        }
        let released = head.truncate_chain(self.cfg.max_chain_length, guard);
        if released > 0 {
            counters::record_truncation(released);
            tracing::trace!(target: "mvkv.gc", released, "spilled chain truncated");
        }
    }

    fn on_logical_delete(
        &self,
        _handle: &GlobalTxnHandle,
        pin: &PinGuard,
        table: &Arc<TxnTable>,
        key: &[u8],
        cell: &HeadRef,
        head: &VersionRecord,
    ) {
        if head.is_enqueued() {
            return;
        }
        head.set_enqueued(true);
        counters::record_deferred_delete();
        let table = Arc::clone(table);
        let key = key.to_vec();
        let cell = Arc::clone(cell);
        pin.defer(move || {
            Self::try_collect_tombstone(&table, &key, &cell);
        });
    }

    fn on_tid_finish(&self, _handle: &GlobalTxnHandle, commit_tid: Tid, _committed: bool) {
        // Publish consistency strictly in TID order: wait for every earlier
        // TID to resolve, then hand the baton on.
        let prev = commit_tid.get() - 1;
        while self
            .last_consistent
            .compare_exchange_weak(prev, commit_tid.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn sync(&self) {}

    fn finish(&self) {}
}

impl std::fmt::Debug for GlobalTid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTid")
            .field("global_tid", &self.global_tid.load(Ordering::Relaxed))
            .field(
                "last_consistent",
                &self.last_consistent.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_trails_commit_handoff() {
        let rt = GlobalTid::new(GlobalTidConfig::default());
        let mut h = rt.begin_txn();
        assert_eq!(h.snapshot, Tid::MIN);

        let t1 = rt.gen_commit_tid(&mut h, &mut (), Tid::MIN);
        assert_eq!(t1, Tid::new(1));
        // Not consistent until the transaction resolves.
        assert_eq!(rt.last_consistent_tid(), Tid::MIN);
        rt.on_tid_finish(&h, t1, true);
        assert_eq!(rt.last_consistent_tid(), t1);

        let h2 = rt.begin_txn();
        assert_eq!(rt.consistent_snapshot_tid(&h2), (true, t1));
    }

    #[test]
    fn tid_handoff_orders_out_of_order_finishes() {
        let rt = GlobalTid::new(GlobalTidConfig::default());
        let mut h = rt.begin_txn();
        let t1 = rt.gen_commit_tid(&mut h, &mut (), Tid::MIN);
        let t2 = rt.gen_commit_tid(&mut h, &mut (), Tid::MIN);

        // Finish the later TID on another thread; it must wait for t1.
        let rt2 = Arc::clone(&rt);
        let h2 = rt.begin_txn();
        let later = std::thread::spawn(move || {
            rt2.on_tid_finish(&h2, t2, true);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(rt.last_consistent_tid(), Tid::MIN, "t2 parked behind t1");

        rt.on_tid_finish(&h, t1, false);
        later.join().unwrap();
        assert_eq!(rt.last_consistent_tid(), t2);
    }

    #[test]
    fn never_overwrites_and_always_reads() {
        let rt = GlobalTid::new(GlobalTidConfig::default());
        let h = rt.begin_txn();
        assert!(!rt.can_overwrite_record_tid(Tid::new(1), Tid::new(2)));
        assert!(rt.can_read_tid(&h, Tid::new(u64::MAX / 2)));
    }
}
