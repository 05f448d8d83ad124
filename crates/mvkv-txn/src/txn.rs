//! Transactions: lifecycle, reads, scans, and the commit protocol.
//!
//! A transaction buffers writes, snapshots reads, and resolves everything at
//! commit:
//!
//! 1. lock the write set's chain heads in canonical `(table, key)` order,
//!    inserting pristine tombstone heads for missing keys;
//! 2. enter the protocol's commit bracket and generate the commit TID;
//! 3. revalidate the read set;
//! 4. revalidate absent ranges (or scanned leaf versions);
//! 5. install the buffered values, swapping in replacement heads where the
//!    old one could not hold the value;
//! 6. fire the protocol's spill and delete hooks;
//! 7. unlock in reverse order, report the TID's resolution, and transition.
//!
//! Any failure between 1 and 5 aborts: locks are released, buffered writes
//! discarded, and the abort reason recorded and counted. A transaction is
//! used by exactly one thread from construction to resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crossbeam_epoch::{Guard, Shared};
use smallvec::SmallVec;

use mvkv_error::{AbortReason, TxnError};
use mvkv_index::{LeafHandle, RangeVisitor, version_parts};
use mvkv_types::{Tid, TxnFlags, TxnState};

use crate::context::{LocalHit, ReadRecord, RecordPtr, TxnContext};
use crate::counters;
use crate::protocol::Protocol;
use crate::range::{KeyRange, key_successor};
use crate::record::{HeadCell, HeadRef, VersionRecord};
use crate::reclaim::PinGuard;
use crate::table::TxnTable;

struct TableCtx {
    table: Arc<TxnTable>,
    ctx: TxnContext,
}

/// One locked write-set entry during commit.
struct Install {
    table: Arc<TxnTable>,
    cell: HeadRef,
    /// The chain head as locked in step 1. Valid while the commit pin lives.
    head: *const VersionRecord,
    key: Box<[u8]>,
    value: Box<[u8]>,
}

/// A transaction over one or more [`TxnTable`]s, monomorphized over its
/// commit protocol.
pub struct Transaction<P: Protocol> {
    protocol: Arc<P>,
    handle: P::TxnHandle,
    /// Read-region pin, held from begin to resolution so every record
    /// pointer captured by a read stays valid.
    pin: Option<PinGuard>,
    state: TxnState,
    flags: TxnFlags,
    reason: Option<AbortReason>,
    snapshot: Tid,
    commit_tid: Option<Tid>,
    /// Table id → per-table context; ordered, so commit walks tables in the
    /// canonical order.
    contexts: BTreeMap<u64, TableCtx>,
}

impl<P: Protocol> Transaction<P> {
    /// Open a transaction against `protocol`.
    #[must_use]
    pub fn begin(protocol: &Arc<P>, flags: TxnFlags) -> Self {
        let pin = protocol.reclaimer().pin();
        let handle = protocol.begin_txn();
        let (consistent, tid) = protocol.consistent_snapshot_tid(&handle);
        let snapshot = if consistent { tid } else { Tid::MAX };
        tracing::trace!(
            target: "mvkv.txn",
            snapshot = snapshot.get(),
            flags = flags.bits(),
            "transaction begun"
        );
        Self {
            protocol: Arc::clone(protocol),
            handle,
            pin: Some(pin),
            state: TxnState::Embryo,
            flags,
            reason: None,
            snapshot,
            commit_tid: None,
            contexts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// The snapshot this transaction reads at.
    #[must_use]
    pub fn snapshot_tid(&self) -> Tid {
        self.snapshot
    }

    /// Why the transaction aborted, once it has.
    #[must_use]
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.reason
    }

    /// The TID this transaction committed at, once it has.
    #[must_use]
    pub fn commit_tid(&self) -> Option<Tid> {
        self.commit_tid
    }

    fn ensure_active(&mut self) -> Result<(), TxnError> {
        match self.state {
            TxnState::Embryo => {
                self.state = TxnState::Active;
                Ok(())
            }
            TxnState::Active => Ok(()),
            TxnState::Committed | TxnState::Aborted => Err(TxnError::Unusable),
        }
    }

    fn context_mut(&mut self, table: &Arc<TxnTable>) -> &mut TxnContext {
        &mut self
            .contexts
            .entry(table.id())
            .or_insert_with(|| TableCtx {
                table: Arc::clone(table),
                ctx: TxnContext::default(),
            })
            .ctx
    }

    fn abort_inner(&mut self, reason: AbortReason) {
        self.state = TxnState::Aborted;
        self.reason = Some(reason);
        counters::record_abort(reason);
        self.contexts.clear();
        self.pin = None;
        self.protocol.end_txn(&mut self.handle);
        tracing::debug!(target: "mvkv.txn", reason = reason.as_str(), "transaction aborted");
    }

    fn abort_with(&mut self, reason: AbortReason) -> TxnError {
        self.abort_inner(reason);
        TxnError::Aborted(reason)
    }

    /// Abort the transaction. Aborting an already-aborted (or committed)
    /// transaction is a no-op.
    pub fn abort(&mut self) {
        if self.state.is_resolved() {
            return;
        }
        self.abort_inner(AbortReason::User);
    }

    // -- reads --------------------------------------------------------------

    /// Read `key`, returning `None` for absent keys (including tombstones).
    ///
    /// Buffered writes win over earlier reads, which win over the index.
    pub fn read(&mut self, table: &Arc<TxnTable>, key: &[u8]) -> Result<Option<Vec<u8>>, TxnError> {
        self.ensure_active()?;
        if let Some(hit) = self
            .contexts
            .get(&table.id())
            .and_then(|t| t.ctx.local_search(key))
        {
            return Ok(local_value(&hit));
        }

        let Some(cell) = table.map().find(key) else {
            // Point miss: cover the key with an absent range so a later
            // insert is caught at commit.
            self.context_mut(table)
                .absent_ranges
                .insert(KeyRange::point(key));
            return Ok(None);
        };

        match self.read_chain(&cell, false) {
            ChainRead::Value { tid, value } => self.admit_read(table, key, tid, value),
            ChainRead::Missing => {
                self.context_mut(table)
                    .absent_ranges
                    .insert(KeyRange::point(key));
                Ok(None)
            }
        }
    }

    /// Scan keys in `[lo, hi)` in order, invoking `visitor(key, value)` for
    /// each present key. The visitor returns `false` to stop early.
    ///
    /// Gaps between delivered keys are recorded as absent ranges (or, in
    /// low-level scan mode, the traversed leaves' versions are recorded)
    /// so phantoms are caught at commit. Keys buffered in the write set but
    /// not yet in the index do not surface.
    pub fn scan<F>(
        &mut self,
        table: &Arc<TxnTable>,
        lo: &[u8],
        hi: Option<&[u8]>,
        mut visitor: F,
    ) -> Result<(), TxnError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.ensure_active()?;
        let low_level = self.flags.contains(TxnFlags::LOW_LEVEL_SCAN);

        #[derive(Default)]
        struct Gather {
            entries: Vec<(Box<[u8]>, HeadRef)>,
            leaves: Vec<(LeafHandle<HeadRef>, u64)>,
        }

        impl RangeVisitor<HeadRef> for Gather {
            fn leaf(&mut self, handle: &LeafHandle<HeadRef>, version: u64) -> bool {
                self.leaves.push((handle.clone(), version));
                true
            }

            fn entry(&mut self, key: &[u8], cell: &HeadRef) -> bool {
                self.entries.push((Box::from(key), Arc::clone(cell)));
                true
            }
        }

        // Gather first: chain reads must not run under the index's leaf
        // locks, or a reader spinning on a record lock could block the
        // holder from touching the leaf.
        let mut gather = Gather::default();
        table.map().range_scan(lo, hi, &mut gather);

        if low_level {
            let ctx = self.context_mut(table);
            for (leaf, version) in gather.leaves {
                ctx.record_leaf_scan(leaf, version);
            }
        }

        let mut cursor = lo.to_vec();
        let mut stopped = false;
        for (key, cell) in gather.entries {
            let Some(value) = self.scan_lookup(table, &key, &cell)? else {
                // Absent (tombstone or no visible version): the gap spans it.
                continue;
            };
            if !low_level {
                self.context_mut(table)
                    .absent_ranges
                    .insert(KeyRange::new(cursor.clone(), key.to_vec()));
            }
            cursor = key_successor(&key);
            if !visitor(&key, &value) {
                stopped = true;
                break;
            }
        }
        if !stopped && !low_level {
            let tail = match hi {
                Some(hi) => KeyRange::new(cursor, hi.to_vec()),
                None => KeyRange::unbounded(cursor),
            };
            self.context_mut(table).absent_ranges.insert(tail);
        }
        Ok(())
    }

    /// Per-key resolution for `scan`: overlay, then the chain.
    fn scan_lookup(
        &mut self,
        table: &Arc<TxnTable>,
        key: &[u8],
        cell: &HeadRef,
    ) -> Result<Option<Vec<u8>>, TxnError> {
        if let Some(hit) = self
            .contexts
            .get(&table.id())
            .and_then(|t| t.ctx.local_search(key))
        {
            return Ok(local_value(&hit));
        }
        match self.read_chain(cell, true) {
            ChainRead::Value { tid, value } => self.admit_read(table, key, tid, value),
            ChainRead::Missing => Ok(None),
        }
    }

    /// Snapshot-read `cell`'s chain under the transaction pin.
    fn read_chain(&self, cell: &HeadRef, from_scan: bool) -> ChainRead {
        let pin = self.pin.as_ref().expect("active transaction holds a pin");
        let guard = pin.guard();
        let head_shared = cell.load(guard);
        // Safety: traversal happens under the pin.
        let Some(head) = (unsafe { head_shared.as_ref() }) else {
            // The cell was collected out from under the index entry.
            return ChainRead::Missing;
        };
        match head.stable_read(self.snapshot, guard) {
            Some((tid, value)) => ChainRead::Value {
                tid,
                value: (value, RecordPtr::new(head)),
            },
            None => {
                // GC'd below the snapshot, or demoted mid-read.
                if from_scan {
                    counters::record_read_deleted_scan();
                } else {
                    counters::record_read_deleted_search();
                }
                ChainRead::Missing
            }
        }
    }

    /// Record a successful chain read and hand back its user-visible value.
    fn admit_read(
        &mut self,
        table: &Arc<TxnTable>,
        key: &[u8],
        tid: Tid,
        (value, record): (Vec<u8>, RecordPtr),
    ) -> Result<Option<Vec<u8>>, TxnError> {
        if tid > self.snapshot || !self.protocol.can_read_tid(&self.handle, tid) {
            return Err(self.abort_with(AbortReason::FutureTidRead));
        }
        let ret = if value.is_empty() {
            None
        } else {
            Some(value.clone())
        };
        self.context_mut(table)
            .read_set
            .insert(Box::from(key), ReadRecord { tid, value, record });
        Ok(ret)
    }

    // -- writes -------------------------------------------------------------

    /// Buffer `value` for `key`. Empty bytes delete the key at commit.
    pub fn write(&mut self, table: &Arc<TxnTable>, key: &[u8], value: &[u8]) -> Result<(), TxnError> {
        self.ensure_active()?;
        if self.flags.contains(TxnFlags::READ_ONLY) {
            self.abort_inner(AbortReason::User);
            return Err(TxnError::ReadOnly);
        }
        self.context_mut(table)
            .write_set
            .insert(Box::from(key), Box::from(value));
        Ok(())
    }

    /// Buffer a delete for `key`.
    pub fn remove(&mut self, table: &Arc<TxnTable>, key: &[u8]) -> Result<(), TxnError> {
        self.write(table, key, &[])
    }

    // -- resolution ---------------------------------------------------------

    /// Commit. `Ok(true)` on success, `Ok(false)` when the transaction
    /// aborted (the reason is retrievable via
    /// [`abort_reason`](Self::abort_reason)). Committing an
    /// already-committed transaction is a no-op.
    pub fn commit(&mut self) -> Result<bool, TxnError> {
        match self.try_commit() {
            Ok(()) => Ok(true),
            Err(TxnError::Aborted(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Commit, propagating an abort as [`TxnError::Aborted`].
    pub fn commit_strict(&mut self) -> Result<(), TxnError> {
        self.try_commit()
    }

    fn try_commit(&mut self) -> Result<(), TxnError> {
        match self.state {
            TxnState::Committed => return Ok(()),
            TxnState::Aborted => {
                return Err(TxnError::Aborted(
                    self.reason.unwrap_or(AbortReason::User),
                ));
            }
            TxnState::Embryo => {
                // Never performed an operation; committing is trivial.
                self.state = TxnState::Committed;
                counters::record_commit();
                self.pin = None;
                self.protocol.end_txn(&mut self.handle);
                return Ok(());
            }
            TxnState::Active => {}
        }

        let protocol = Arc::clone(&self.protocol);
        let pin = self.pin.take().expect("active transaction holds a pin");

        // Step 1: lock write-set heads in canonical (table, key) order,
        // inserting pristine tombstone heads for keys the index lacks.
        let mut work: Vec<(Arc<TxnTable>, Box<[u8]>, Box<[u8]>)> = Vec::new();
        for tctx in self.contexts.values_mut() {
            let write_set = std::mem::take(&mut tctx.ctx.write_set);
            for (key, value) in write_set {
                work.push((Arc::clone(&tctx.table), key, value));
            }
        }
        let mut installs: SmallVec<[Install; 8]> = SmallVec::new();
        for (table, key, value) in work {
            let guard = pin.guard();
            let locked = loop {
                let cell = match table.map().find(&key) {
                    Some(cell) => cell,
                    None => {
                        let fresh = HeadCell::with_head(VersionRecord::alloc_first(value.len()));
                        // On a raced insert the winner's cell comes back.
                        table.map().insert_if_absent(&key, fresh).value
                    }
                };
                let head_shared = cell.load(guard);
                // Safety: pinned.
                let Some(head) = (unsafe { head_shared.as_ref() }) else {
                    // Collected between find and load; the index entry is
                    // gone, so retry and insert a fresh head.
                    continue;
                };
                head.lock();
                if !head.is_latest() || head.is_deleting() {
                    head.unlock();
                    break None;
                }
                break Some((cell, head as *const VersionRecord));
            };
            let Some((cell, head)) = locked else {
                return Err(self.fail_commit(
                    &protocol,
                    &installs,
                    None,
                    AbortReason::WriteNodeInterference,
                ));
            };
            installs.push(Install {
                table,
                cell,
                head,
                key,
                value,
            });
        }

        // Keys this commit writes, for self-exclusion during validation.
        let mut own: HashMap<u64, HashSet<&[u8]>> = HashMap::new();
        for ins in &installs {
            own.entry(ins.table.id()).or_default().insert(&ins.key);
        }

        // Step 2: commit bracket and TID generation. From here on the
        // protocol must hear about this TID's resolution either way.
        let mut permit = protocol.commit_begin(&self.handle);
        let mut dep_max = Tid::MIN;
        for ins in &installs {
            // Safety: locked in step 1, pinned.
            dep_max = dep_max.max(unsafe { (*ins.head).version_tid() });
        }
        for tctx in self.contexts.values() {
            for rr in tctx.ctx.read_set.values() {
                dep_max = dep_max.max(rr.tid);
            }
        }
        let commit_tid = protocol.gen_commit_tid(&mut self.handle, &mut permit, dep_max);

        // Step 3: revalidate the read set.
        let mut failure: Option<AbortReason> = None;
        'validate: for tctx in self.contexts.values() {
            let own_keys = own.get(&tctx.table.id());
            for (key, rr) in &tctx.ctx.read_set {
                debug_assert!(rr.tid <= self.snapshot, "future tid surfaced at read time");
                // Safety: the pin predates the pointer capture.
                let rec = unsafe { rr.record.get() };
                if own_keys.is_some_and(|keys| keys.contains(&**key)) {
                    // We hold this head's lock; check it directly. A read
                    // served from an older chain entry fails `is_latest`.
                    if !(rec.is_latest() && rec.version_tid() == rr.tid) {
                        failure = Some(AbortReason::ReadNodeInterference);
                        break 'validate;
                    }
                } else {
                    match rec.validate_read(self.snapshot, rr.tid) {
                        crate::record::StableCheck::Unstable => {
                            failure = Some(AbortReason::UnstableRead);
                            break 'validate;
                        }
                        crate::record::StableCheck::Changed => {
                            failure = Some(AbortReason::ReadNodeInterference);
                            break 'validate;
                        }
                        crate::record::StableCheck::Ok => {}
                    }
                }
            }
        }

        // Step 4: revalidate absence: scanned leaf versions or ranges.
        if failure.is_none() {
            failure = if self.flags.contains(TxnFlags::LOW_LEVEL_SCAN) {
                self.validate_leaf_scans()
            } else {
                self.validate_absent_ranges(&own, pin.guard())
            };
        }
        if let Some(reason) = failure {
            return Err(self.fail_commit(&protocol, &installs, Some(commit_tid), reason));
        }

        // Step 5/6: install buffered values and fire the GC hooks.
        for ins in &installs {
            let guard = pin.guard();
            // Safety: locked, pinned.
            let head = unsafe { &*ins.head };
            if head.is_enqueued() {
                // A pending tombstone collection loses to this write.
                head.set_enqueued(false);
            }
            let can = protocol.can_overwrite_record_tid(head.version_tid(), commit_tid);
            let out = head.write_record_at(can, commit_tid, &ins.value, guard);
            match out.replacement {
                Some(rep) => {
                    if out.grew {
                        // Spill hook, before the replacement becomes
                        // reachable: the chain is still exclusively ours.
                        protocol.on_record_spill(&self.handle, &pin, &ins.cell, &rep);
                    } else {
                        // The old head fell out of the chain entirely.
                        head.mark_deleting();
                        // Safety: unlinked once the replacement is stored.
                        unsafe { guard.defer_destroy(Shared::from(ins.head)) };
                    }
                    let _ = ins.cell.store(rep, guard);
                }
                None => {
                    if out.grew {
                        protocol.on_record_spill(&self.handle, &pin, &ins.cell, head);
                    }
                }
            }
            if ins.value.is_empty() {
                protocol.on_logical_delete(
                    &self.handle,
                    &pin,
                    &ins.table,
                    &ins.key,
                    &ins.cell,
                    head,
                );
            }
        }

        // Step 7: unlock in reverse order, resolve the TID, transition.
        for ins in installs.iter().rev() {
            // Safety: locked in step 1.
            unsafe { (*ins.head).unlock() };
        }
        protocol.on_tid_finish(&self.handle, commit_tid, true);
        drop(permit);
        self.state = TxnState::Committed;
        self.commit_tid = Some(commit_tid);
        counters::record_commit();
        tracing::debug!(target: "mvkv.txn", tid = commit_tid.get(), "transaction committed");
        self.contexts.clear();
        drop(pin);
        protocol.end_txn(&mut self.handle);
        Ok(())
    }

    fn validate_leaf_scans(&self) -> Option<AbortReason> {
        for tctx in self.contexts.values() {
            for (leaf, observed) in &tctx.ctx.leaf_scans {
                let current = leaf.version();
                if current == *observed {
                    continue;
                }
                let (structure_now, _) = version_parts(current);
                let (structure_then, _) = version_parts(*observed);
                // A reorganization and an insert both move the stamp; the
                // reorganization is the stronger signal.
                return Some(if structure_now != structure_then {
                    AbortReason::NodeScanReadVersionChanged
                } else {
                    AbortReason::NodeScanWriteVersionChanged
                });
            }
        }
        None
    }

    fn validate_absent_ranges(
        &self,
        own: &HashMap<u64, HashSet<&[u8]>>,
        guard: &Guard,
    ) -> Option<AbortReason> {
        struct AbsenceProbe<'a> {
            own_keys: Option<&'a HashSet<&'a [u8]>>,
            guard: &'a Guard,
            clean: bool,
        }

        impl RangeVisitor<HeadRef> for AbsenceProbe<'_> {
            fn entry(&mut self, key: &[u8], cell: &HeadRef) -> bool {
                if self.own_keys.is_some_and(|keys| keys.contains(key)) {
                    // Our own step-1 tombstone head; it is still absent.
                    return true;
                }
                let head = cell.load(self.guard);
                // Safety: the caller's pin covers the probe.
                match unsafe { head.as_ref() } {
                    // A collected cell is as absent as it gets.
                    None => true,
                    Some(head) => {
                        if head.stable_latest_value_is_nil() {
                            true
                        } else {
                            self.clean = false;
                            false
                        }
                    }
                }
            }
        }

        for tctx in self.contexts.values() {
            let own_keys = own.get(&tctx.table.id());
            for range in tctx.ctx.absent_ranges.iter() {
                let mut probe = AbsenceProbe {
                    own_keys,
                    guard,
                    clean: true,
                };
                tctx.table
                    .map()
                    .range_scan(&range.start, range.end.as_deref(), &mut probe);
                if !probe.clean {
                    return Some(AbortReason::ReadAbsenceInterference);
                }
            }
        }
        None
    }

    fn fail_commit(
        &mut self,
        protocol: &Arc<P>,
        installs: &[Install],
        finished_tid: Option<Tid>,
        reason: AbortReason,
    ) -> TxnError {
        for ins in installs.iter().rev() {
            // Safety: locked in step 1; no head has been replaced yet on
            // any failure path.
            unsafe { (*ins.head).unlock() };
        }
        if let Some(tid) = finished_tid {
            protocol.on_tid_finish(&self.handle, tid, false);
        }
        self.abort_inner(reason);
        TxnError::Aborted(reason)
    }
}

enum ChainRead {
    Value { tid: Tid, value: (Vec<u8>, RecordPtr) },
    Missing,
}

fn local_value(hit: &LocalHit<'_>) -> Option<Vec<u8>> {
    match hit {
        LocalHit::Buffered(bytes) if bytes.is_empty() => None,
        LocalHit::Buffered(bytes) => Some(bytes.to_vec()),
        LocalHit::Read(rr) if rr.value.is_empty() => None,
        LocalHit::Read(rr) => Some(rr.value.clone()),
    }
}

impl<P: Protocol> Drop for Transaction<P> {
    fn drop(&mut self) {
        if !self.state.is_resolved() {
            self.abort_inner(AbortReason::User);
        }
    }
}

impl<P: Protocol> std::fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("snapshot", &self.snapshot)
            .field("tables", &self.contexts.len())
            .finish_non_exhaustive()
    }
}
