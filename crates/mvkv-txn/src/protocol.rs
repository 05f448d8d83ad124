//! The commit-protocol seam.
//!
//! The two timestamp protocols differ in how commit TIDs are generated, what
//! snapshot a transaction reads at, whether a version may be overwritten in
//! place, and how spilled chains and tombstones are garbage-collected. That
//! difference is captured here as a trait; transactions are monomorphized
//! over the protocol type, so none of these calls dispatch dynamically.
//!
//! A protocol implementation is a *runtime*: process-wide counters, per-core
//! state, worker threads. It is passed to transaction construction as an
//! explicit `Arc`, never reached through globals, so tests can run isolated
//! runtimes side by side.

use std::sync::Arc;

use mvkv_types::Tid;

use crate::reclaim::{PinGuard, Reclaimer};
use crate::record::{HeadRef, VersionRecord};
use crate::table::TxnTable;

/// Commit-protocol capability set. See the module docs.
pub trait Protocol: Send + Sync + Sized + 'static {
    /// Per-transaction protocol state (snapshot, core assignment, ...).
    type TxnHandle: Send + 'static;

    /// Held across commit steps 2–7. The epoch protocol keeps its per-core
    /// spinlock here; the global protocol needs nothing.
    type CommitGuard<'p>
    where
        Self: 'p;

    /// The grace-period reclaimer this runtime retires records through.
    fn reclaimer(&self) -> &Arc<Reclaimer>;

    /// Called at transaction construction. Captures the snapshot and any
    /// per-thread accounting (nest level, core slot).
    fn begin_txn(&self) -> Self::TxnHandle;

    /// Called exactly once at transaction resolution.
    fn end_txn(&self, handle: &mut Self::TxnHandle);

    /// The snapshot the transaction reads at: `(consistent, tid)`. When not
    /// consistent, callers read at [`Tid::MAX`] (latest visible).
    fn consistent_snapshot_tid(&self, handle: &Self::TxnHandle) -> (bool, Tid);

    /// Whether a version stamped `t` may be read by this transaction.
    fn can_read_tid(&self, handle: &Self::TxnHandle, t: Tid) -> bool;

    /// Whether a commit at `cur` may overwrite a version stamped `prev` in
    /// place instead of spilling it into the chain.
    fn can_overwrite_record_tid(&self, prev: Tid, cur: Tid) -> bool;

    /// Enter the commit critical section (before TID generation).
    fn commit_begin<'p>(&'p self, handle: &Self::TxnHandle) -> Self::CommitGuard<'p>;

    /// Generate this transaction's commit TID. `dep_max` is the maximum of
    /// every locked write head's current version and every observed read
    /// TID; the returned TID is strictly greater.
    fn gen_commit_tid(
        &self,
        handle: &mut Self::TxnHandle,
        permit: &mut Self::CommitGuard<'_>,
        dep_max: Tid,
    ) -> Tid;

    /// A commit grew `cell`'s chain. Called with exclusive ownership of
    /// `head` (its lock held, or not yet published) and inside a reclaimer
    /// read region; the protocol may truncate now or schedule truncation.
    fn on_record_spill(
        &self,
        handle: &Self::TxnHandle,
        pin: &PinGuard,
        cell: &HeadRef,
        head: &VersionRecord,
    );

    /// A commit installed a tombstone as `cell`'s latest value. Called with
    /// the head lock held; the protocol may schedule removal of the index
    /// entry.
    fn on_logical_delete(
        &self,
        handle: &Self::TxnHandle,
        pin: &PinGuard,
        table: &Arc<TxnTable>,
        key: &[u8],
        cell: &HeadRef,
        head: &VersionRecord,
    );

    /// Called with the resolution of every transaction that generated a
    /// commit TID, commit and abort alike, after all record locks are
    /// released.
    fn on_tid_finish(&self, handle: &Self::TxnHandle, commit_tid: Tid, committed: bool);

    /// Block until newly committed work is visible to fresh snapshots (an
    /// epoch turn under the epoch protocol; a no-op under the global one).
    fn sync(&self);

    /// Block until deferred protocol work has drained.
    fn finish(&self);
}
