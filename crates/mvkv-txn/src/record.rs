//! Per-key version records and their lock-free chain protocol.
//!
//! A [`VersionRecord`] is one cell of a per-key version chain, linked
//! newest-first through an epoch-managed `next` pointer. All synchronization
//! on a record goes through the single packed `hdr` word:
//!
//! ```text
//! [ locked | deleting | enqueued | latest | change counter ]
//! [  0..1  |   1..2   |   2..3   |  3..4  |     4..64      ]
//! ```
//!
//! Writers take the bit-0 spin lock, publish the non-atomic fields, and bump
//! the change counter on unlock. Readers never lock: they sample a stable
//! header, copy what they need, and re-check the header. It is the same
//! sample/read/re-check discipline as a seqlock, with the counter in the
//! header playing the sequence number. A torn copy is always detected by the
//! re-check and discarded.
//!
//! The counter occupies 60 bits; ABA would require 2^60 lock/unlock pairs
//! between a reader's two header samples. We accept that as astronomically
//! improbable.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use mvkv_types::Tid;

/// Spin budget of the bounded stable-version read.
pub const STABLE_READ_SPINS: u32 = 16;

const HDR_LOCKED: u64 = 0x1;
const HDR_DELETING: u64 = 0x1 << 1;
const HDR_ENQUEUED: u64 = 0x1 << 2;
const HDR_LATEST: u64 = 0x1 << 3;
const HDR_COUNTER_SHIFT: u32 = 4;
const HDR_COUNTER_MASK: u64 = !0_u64 << HDR_COUNTER_SHIFT;

/// Payload capacities are rounded up to this granule so small in-place
/// updates do not force a reallocation.
const ALLOC_GRANULE: usize = 16;

#[inline]
const fn round_up_alloc(n: usize) -> usize {
    let n = if n < ALLOC_GRANULE { ALLOC_GRANULE } else { n };
    (n + ALLOC_GRANULE - 1) / ALLOC_GRANULE * ALLOC_GRANULE
}

/// Outcome of [`VersionRecord::write_record_at`].
pub struct WriteOutcome {
    /// Whether the number of versions in the chain increased.
    pub grew: bool,
    /// When set, this record was demoted and the returned record is meant to
    /// replace it as the chain head; the caller must swap the index entry.
    pub replacement: Option<Owned<VersionRecord>>,
}

/// Result of a bounded latest-version revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableCheck {
    /// The header never stabilized within the spin budget.
    Unstable,
    /// Stable, but the record no longer matches what the caller observed.
    Changed,
    /// Stable and still matching.
    Ok,
}

/// One cell of a per-key version chain. See the module docs for the header
/// protocol.
pub struct VersionRecord {
    hdr: AtomicU64,
    next: Atomic<VersionRecord>,
    /// Tid of the writing transaction. Written under the lock, read under
    /// the header sandwich.
    version: AtomicU64,
    /// Value length; 0 is a tombstone.
    len: AtomicU32,
    cap: u32,
    /// `cap` heap bytes. Contents are written only under the lock; readers
    /// copy racily and rely on the header sandwich to discard torn copies.
    payload: UnsafeCell<NonNull<u8>>,
}

// Safety: all mutation of non-atomic state happens under the hdr spin lock,
// and racy reads are validated by the header sandwich before use.
unsafe impl Send for VersionRecord {}
unsafe impl Sync for VersionRecord {}

impl VersionRecord {
    fn with_payload(hdr: u64, version: Tid, value: &[u8], cap: usize) -> Self {
        debug_assert!(value.len() <= cap);
        let mut buf = vec![0_u8; cap].into_boxed_slice();
        buf[..value.len()].copy_from_slice(value);
        let ptr = Box::into_raw(buf).cast::<u8>();
        Self {
            hdr: AtomicU64::new(hdr),
            next: Atomic::null(),
            version: AtomicU64::new(version.get()),
            len: AtomicU32::new(value.len() as u32),
            cap: cap as u32,
            // Safety: Box::into_raw never returns null.
            payload: UnsafeCell::new(unsafe { NonNull::new_unchecked(ptr) }),
        }
    }

    /// Allocate the initial head for a key: a pristine tombstone at
    /// [`Tid::MIN`], marked LATEST.
    #[must_use]
    pub fn alloc_first(value_size_hint: usize) -> Owned<Self> {
        Owned::new(Self::with_payload(
            HDR_LATEST,
            Tid::MIN,
            &[],
            round_up_alloc(value_size_hint),
        ))
    }

    /// Allocate a value-carrying record linked in front of `next`.
    #[must_use]
    pub fn alloc(
        version: Tid,
        value: &[u8],
        next: Shared<'_, VersionRecord>,
        latest: bool,
    ) -> Owned<Self> {
        let rec = Self::with_payload(
            if latest { HDR_LATEST } else { 0 },
            version,
            value,
            round_up_alloc(value.len()),
        );
        rec.next.store(next, Ordering::Relaxed);
        Owned::new(rec)
    }

    // -- header bit helpers -------------------------------------------------

    #[inline]
    const fn hdr_locked(v: u64) -> bool {
        v & HDR_LOCKED != 0
    }

    #[inline]
    const fn hdr_latest(v: u64) -> bool {
        v & HDR_LATEST != 0
    }

    /// Change counter embedded in a header word.
    #[inline]
    #[must_use]
    pub const fn change_count(v: u64) -> u64 {
        (v & HDR_COUNTER_MASK) >> HDR_COUNTER_SHIFT
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        Self::hdr_locked(self.hdr.load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn is_latest(&self) -> bool {
        Self::hdr_latest(self.hdr.load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.hdr.load(Ordering::Relaxed) & HDR_DELETING != 0
    }

    #[inline]
    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        self.hdr.load(Ordering::Relaxed) & HDR_ENQUEUED != 0
    }

    // -- lock ---------------------------------------------------------------

    /// Spin until the bit-0 lock is held. Not re-entrant.
    pub fn lock(&self) {
        loop {
            let v = self.hdr.load(Ordering::Relaxed);
            if !Self::hdr_locked(v)
                && self
                    .hdr
                    .compare_exchange_weak(v, v | HDR_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Release the lock, bumping the change counter.
    pub fn unlock(&self) {
        let v = self.hdr.load(Ordering::Relaxed);
        debug_assert!(Self::hdr_locked(v), "unlock of unlocked record");
        let n = Self::change_count(v).wrapping_add(1);
        let next = (v & !HDR_COUNTER_MASK & !HDR_LOCKED) | ((n << HDR_COUNTER_SHIFT) & HDR_COUNTER_MASK);
        self.hdr.store(next, Ordering::Release);
    }

    /// Set the DELETING bit. Caller must hold the lock.
    pub fn mark_deleting(&self) {
        debug_assert!(self.is_locked());
        debug_assert!(!self.is_enqueued(), "enqueued record marked deleting");
        debug_assert!(!self.is_deleting());
        self.hdr.fetch_or(HDR_DELETING, Ordering::Relaxed);
    }

    /// Set or clear the ENQUEUED (GC pending) bit. Caller must hold the lock.
    pub fn set_enqueued(&self, enqueued: bool) {
        debug_assert!(self.is_locked());
        debug_assert!(!self.is_deleting(), "deleting record enqueued");
        if enqueued {
            self.hdr.fetch_or(HDR_ENQUEUED, Ordering::Relaxed);
        } else {
            self.hdr.fetch_and(!HDR_ENQUEUED, Ordering::Relaxed);
        }
    }

    /// Set or clear the LATEST bit. Caller must hold the lock.
    pub fn set_latest(&self, latest: bool) {
        debug_assert!(self.is_locked());
        if latest {
            self.hdr.fetch_or(HDR_LATEST, Ordering::Relaxed);
        } else {
            self.hdr.fetch_and(!HDR_LATEST, Ordering::Relaxed);
        }
    }

    // -- stable version protocol --------------------------------------------

    /// Spin until the header is observed unlocked, and return it.
    #[must_use]
    pub fn stable_version(&self) -> u64 {
        loop {
            let v = self.hdr.load(Ordering::Acquire);
            if !Self::hdr_locked(v) {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// Bounded variant of [`stable_version`](Self::stable_version): gives up
    /// after `spins` attempts instead of spinning indefinitely.
    #[must_use]
    pub fn try_stable_version(&self, mut spins: u32) -> Option<u64> {
        loop {
            let v = self.hdr.load(Ordering::Acquire);
            if !Self::hdr_locked(v) {
                return Some(v);
            }
            if spins == 0 {
                return None;
            }
            spins -= 1;
            std::hint::spin_loop();
        }
    }

    /// Whether the header still equals `v` (closes the read sandwich).
    #[must_use]
    pub fn check_version(&self, v: u64) -> bool {
        self.hdr.load(Ordering::Acquire) == v
    }

    // -- field access -------------------------------------------------------

    /// Version Tid. Meaningful under the lock or inside a header sandwich.
    #[inline]
    #[must_use]
    pub fn version_tid(&self) -> Tid {
        Tid::new(self.version.load(Ordering::Relaxed))
    }

    /// Value length; 0 means tombstone. Same caveat as
    /// [`version_tid`](Self::version_tid).
    #[inline]
    #[must_use]
    pub fn value_len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    /// Reserved payload capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap as usize
    }

    /// The never-written initial tombstone every chain starts with.
    #[inline]
    fn is_pristine(&self) -> bool {
        self.version.load(Ordering::Relaxed) == Tid::MIN.get()
            && self.len.load(Ordering::Relaxed) == 0
    }

    /// Next-older record in the chain.
    #[must_use]
    pub fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, VersionRecord> {
        self.next.load(Ordering::Acquire, guard)
    }

    /// Copy out the current payload.
    ///
    /// Racy unless the caller holds the lock; racing callers must validate
    /// with the header sandwich and discard torn copies.
    fn copy_value(&self) -> Vec<u8> {
        let len = (self.len.load(Ordering::Acquire) as usize).min(self.cap as usize);
        let mut out = vec![0_u8; len];
        // Safety: the buffer is `cap` bytes and lives as long as `self`;
        // `len <= cap` was just clamped. The byte contents may race with an
        // in-place overwrite, which the caller's sandwich detects.
        unsafe {
            std::ptr::copy_nonoverlapping((*self.payload.get()).as_ptr(), out.as_mut_ptr(), len);
        }
        out
    }

    /// Overwrite version, length, and payload in place. Caller holds the lock
    /// and has checked `value.len() <= cap`.
    fn overwrite(&self, t: Tid, value: &[u8]) {
        debug_assert!(self.is_locked());
        debug_assert!(value.len() <= self.cap as usize);
        self.version.store(t.get(), Ordering::Relaxed);
        self.len.store(value.len() as u32, Ordering::Release);
        // Safety: exclusive writer under the lock; buffer is `cap` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                value.as_ptr(),
                (*self.payload.get()).as_ptr(),
                value.len(),
            );
        }
    }

    // -- optimistic reads ---------------------------------------------------

    /// Find and copy the value visible at snapshot `t`.
    ///
    /// Returns the writing Tid and the bytes, or `None` when no visible
    /// version exists, including the case where this record was demoted
    /// from LATEST mid-read (the caller treats the key as missing or retries
    /// at a higher level).
    ///
    /// Must not be called while holding this record's lock: the sandwich
    /// would spin on the caller's own lock.
    #[must_use]
    pub fn stable_read<'g>(&'g self, t: Tid, guard: &'g Guard) -> Option<(Tid, Vec<u8>)> {
        let mut rec: &VersionRecord = self;
        let mut require_latest = true;
        loop {
            let v = rec.stable_version();
            let next = rec.next(guard);
            let version = rec.version_tid();
            let found = version <= t;
            if found && require_latest && !Self::hdr_latest(v) {
                // Demoted while we were reading.
                return None;
            }
            let value = if found { Some(rec.copy_value()) } else { None };
            if !rec.check_version(v) {
                continue;
            }
            if let Some(value) = value {
                return Some((version, value));
            }
            // Safety: the chain is traversed under `guard`; severed nodes
            // are only reclaimed after a grace period.
            match unsafe { next.as_ref() } {
                Some(older) => {
                    rec = older;
                    require_latest = false;
                }
                None => return None,
            }
        }
    }

    /// Bounded check that this record is still the latest version visible at
    /// `t` and still carries `observed` as its version.
    ///
    /// Distinguishes "could not stabilize" from "stabilized but moved" so
    /// commit validation can classify the abort.
    #[must_use]
    pub fn validate_read(&self, t: Tid, observed: Tid) -> StableCheck {
        let Some(v) = self.try_stable_version(STABLE_READ_SPINS) else {
            return StableCheck::Unstable;
        };
        let ok = Self::hdr_latest(v) && self.version_tid() == observed && observed <= t;
        // Re-checking only matters when the answer would be yes; a version
        // change means the answer is final either way.
        if ok && self.check_version(v) {
            StableCheck::Ok
        } else {
            StableCheck::Changed
        }
    }

    /// Bounded check that this record is still the LATEST version and visible
    /// at `t`.
    #[must_use]
    pub fn stable_is_latest_version(&self, t: Tid) -> bool {
        let Some(v) = self.try_stable_version(STABLE_READ_SPINS) else {
            return false;
        };
        let ok = Self::hdr_latest(v) && self.version_tid() <= t;
        ok && self.check_version(v)
    }

    /// Whether the latest value is a tombstone. Meaningful under the lock;
    /// racing callers want [`stable_latest_value_is_nil`](Self::stable_latest_value_is_nil).
    #[must_use]
    pub fn latest_value_is_nil(&self) -> bool {
        self.is_latest() && self.len.load(Ordering::Relaxed) == 0
    }

    /// Bounded check that the latest value is a tombstone. Unstable headers
    /// conservatively report `false`.
    #[must_use]
    pub fn stable_latest_value_is_nil(&self) -> bool {
        let Some(v) = self.try_stable_version(STABLE_READ_SPINS) else {
            return false;
        };
        let ok = Self::hdr_latest(v) && self.len.load(Ordering::Relaxed) == 0;
        ok && self.check_version(v)
    }

    // -- writes -------------------------------------------------------------

    /// Install `value` at timestamp `t` into the latest slot of the chain.
    ///
    /// Caller holds this record's lock and this record is the chain head
    /// (LATEST). `can_overwrite` is the protocol's verdict on replacing the
    /// current version's timestamp with `t`; a pristine initial tombstone is
    /// always overwritten in place.
    ///
    /// Returns whether the chain grew and, when the head had to be replaced,
    /// the replacement record the caller must install in the index.
    #[must_use]
    pub fn write_record_at(
        &self,
        can_overwrite: bool,
        t: Tid,
        value: &[u8],
        guard: &Guard,
    ) -> WriteOutcome {
        debug_assert!(self.is_locked());
        debug_assert!(self.is_latest());
        debug_assert!(self.version_tid() < t);

        if can_overwrite || self.is_pristine() {
            if value.len() <= self.cap as usize {
                self.overwrite(t, value);
                return WriteOutcome {
                    grew: false,
                    replacement: None,
                };
            }
            // Same logical slot, bigger value: replace the head, keeping the
            // rest of the chain.
            self.set_latest(false);
            let rep = Self::alloc(t, value, self.next(guard), true);
            return WriteOutcome {
                grew: false,
                replacement: Some(rep),
            };
        }

        // History must be preserved: spill.
        if value.len() <= self.cap as usize {
            let spill = Self::alloc(self.version_tid(), &self.copy_value(), self.next(guard), false);
            self.next.store(spill, Ordering::Release);
            self.overwrite(t, value);
            return WriteOutcome {
                grew: true,
                replacement: None,
            };
        }

        self.set_latest(false);
        let rep = Self::alloc(t, value, Shared::from(self as *const VersionRecord), true);
        WriteOutcome {
            grew: true,
            replacement: Some(rep),
        }
    }

    // -- release ------------------------------------------------------------

    /// Retire a record through the grace-period reclaimer.
    ///
    /// Marks DELETING (taking the lock briefly) and schedules destruction
    /// once no in-flight reader can hold a reference.
    pub fn release(rec: Shared<'_, VersionRecord>, guard: &Guard) {
        let Some(r) = (unsafe { rec.as_ref() }) else {
            return;
        };
        r.lock();
        r.mark_deleting();
        r.unlock();
        // Safety: the caller has unlinked `rec` from every published chain;
        // destruction is deferred past the grace period.
        unsafe { guard.defer_destroy(rec) };
    }

    /// Retire a whole chain starting at `rec` (following `next` links).
    ///
    /// Returns the number of records released.
    pub fn release_chain(rec: Shared<'_, VersionRecord>, guard: &Guard) -> usize {
        let mut released = 0;
        let mut cur = rec;
        while let Some(r) = unsafe { cur.as_ref() } {
            let next = r.next(guard);
            Self::release(cur, guard);
            released += 1;
            cur = next;
        }
        released
    }

    /// Free a chain immediately, without the reclaimer.
    ///
    /// Only valid when no reader can observe any record of the chain
    /// (teardown, or never-published records).
    pub(crate) unsafe fn release_chain_now(rec: Shared<'_, VersionRecord>) {
        let mut cur = rec;
        while !cur.is_null() {
            // Safety: caller guarantees exclusive access to the whole chain.
            let owned = unsafe { cur.into_owned() };
            cur = owned.next.load(Ordering::Relaxed, unsafe {
                crossbeam_epoch::unprotected()
            });
            drop(owned);
        }
    }

    /// Number of records in the chain from here down. Meaningful while the
    /// head is locked (interior links only move under the head lock).
    #[must_use]
    pub fn chain_len(&self, guard: &Guard) -> usize {
        let mut n = 1;
        let mut cur = self.next(guard);
        while let Some(r) = unsafe { cur.as_ref() } {
            n += 1;
            cur = r.next(guard);
        }
        n
    }

    /// Sever the chain after `keep` records and retire the tail.
    ///
    /// Caller must own the chain head: either hold its lock or hold the only
    /// reference to a not-yet-published head.
    pub fn truncate_chain(&self, keep: usize, guard: &Guard) -> usize {
        debug_assert!(keep >= 1);
        let mut cur: &VersionRecord = self;
        for _ in 1..keep {
            let next = cur.next(guard);
            match unsafe { next.as_ref() } {
                Some(r) => cur = r,
                None => return 0,
            }
        }
        let tail = cur.next.swap(Shared::null(), Ordering::AcqRel, guard);
        if tail.is_null() {
            return 0;
        }
        Self::release_chain(tail, guard)
    }
}

impl Drop for VersionRecord {
    fn drop(&mut self) {
        // Safety: reconstructs the boxed slice allocated in `with_payload`.
        unsafe {
            let ptr = (*self.payload.get()).as_ptr();
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                ptr,
                self.cap as usize,
            )));
        }
    }
}

impl std::fmt::Debug for VersionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.hdr.load(Ordering::Relaxed);
        write!(
            f,
            "VersionRecord(version={}, len={}, locked={}, latest={}, deleting={}, enqueued={}, changes={})",
            self.version_tid(),
            self.value_len(),
            Self::hdr_locked(v),
            Self::hdr_latest(v),
            v & HDR_DELETING != 0,
            v & HDR_ENQUEUED != 0,
            Self::change_count(v),
        )
    }
}

// ---------------------------------------------------------------------------
// HeadCell
// ---------------------------------------------------------------------------

/// The per-key cell the index stores: an atomically replaceable pointer to
/// the chain head.
///
/// The cell owns the head (and, transitively through `next`, the whole
/// chain). Replacement stores the new head and hands the chain it displaced
/// to the reclaimer separately.
pub struct HeadCell {
    head: Atomic<VersionRecord>,
}

/// Shared handle to a [`HeadCell`], as stored in the index and captured by
/// deferred GC work.
pub type HeadRef = std::sync::Arc<HeadCell>;

impl HeadCell {
    /// Create a cell owning `head`.
    #[must_use]
    pub fn with_head(head: Owned<VersionRecord>) -> HeadRef {
        std::sync::Arc::new(Self {
            head: Atomic::from(head),
        })
    }

    /// Current chain head.
    #[must_use]
    pub fn load<'g>(&self, guard: &'g Guard) -> Shared<'g, VersionRecord> {
        self.head.load(Ordering::Acquire, guard)
    }

    /// Atomically replace the chain head. Returns the new head.
    pub fn store<'g>(&self, rep: Owned<VersionRecord>, guard: &'g Guard) -> Shared<'g, VersionRecord> {
        let shared = rep.into_shared(guard);
        self.head.store(shared, Ordering::Release);
        shared
    }

    /// Detach the chain from the cell.
    ///
    /// Used when the whole chain has been collected: late GC work holding
    /// this cell must see an empty cell, never a retired head.
    pub fn clear(&self) {
        self.head.store(Shared::null(), Ordering::Release);
    }
}

impl Drop for HeadCell {
    fn drop(&mut self) {
        // Safety: the last reference to the cell is going away, so no reader
        // can reach the chain anymore; free it directly.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let head = self.head.load(Ordering::Relaxed, guard);
            VersionRecord::release_chain_now(head);
        }
    }
}

impl std::fmt::Debug for HeadCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeadCell(..)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn pinned() -> crossbeam_epoch::Guard {
        crossbeam_epoch::pin()
    }

    #[test]
    fn fresh_head_is_pristine_tombstone() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(8));
        let head = cell.load(&guard);
        let r = unsafe { head.as_ref() }.unwrap();
        assert!(r.is_latest());
        assert_eq!(r.version_tid(), Tid::MIN);
        assert_eq!(r.value_len(), 0);
        assert!(r.stable_latest_value_is_nil());
        let (tid, value) = r.stable_read(Tid::new(100), &guard).unwrap();
        assert_eq!(tid, Tid::MIN);
        assert!(value.is_empty(), "tombstone reads as an empty value");
    }

    #[test]
    fn tombstone_read_returns_empty_value() {
        // stable_read yields the tombstone entry itself (empty bytes), which
        // callers map to "absent". A pristine head has no such entry visible
        // above, so exercise a committed tombstone instead.
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(8));
        let head = cell.load(&guard);
        let r = unsafe { head.as_ref() }.unwrap();

        r.lock();
        let out = r.write_record_at(false, Tid::new(5), b"", &guard);
        r.unlock();
        assert!(!out.grew, "pristine tombstone is overwritten in place");
        assert!(out.replacement.is_none());

        let (tid, value) = r.stable_read(Tid::new(9), &guard).unwrap();
        assert_eq!(tid, Tid::new(5));
        assert!(value.is_empty());
    }

    #[test]
    fn unlock_bumps_change_counter() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(0));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        let before = VersionRecord::change_count(r.stable_version());
        for _ in 0..5 {
            r.lock();
            r.unlock();
        }
        let after = VersionRecord::change_count(r.stable_version());
        assert_eq!(after, before + 5);
    }

    #[test]
    fn in_place_overwrite_when_capacity_allows() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(16));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        r.lock();
        let first = r.write_record_at(false, Tid::new(1), b"aaa", &guard);
        r.unlock();
        assert!(!first.grew);

        // Same-slot overwrite permitted by the protocol.
        r.lock();
        let second = r.write_record_at(true, Tid::new(2), b"bbb", &guard);
        r.unlock();
        assert!(!second.grew);
        assert!(second.replacement.is_none());
        assert_eq!(r.chain_len(&guard), 1);

        let (tid, value) = r.stable_read(Tid::new(2), &guard).unwrap();
        assert_eq!(tid, Tid::new(2));
        assert_eq!(value, b"bbb");
    }

    #[test]
    fn spill_preserves_history() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(16));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        r.lock();
        let _ = r.write_record_at(false, Tid::new(1), b"v1", &guard);
        r.unlock();

        r.lock();
        let out = r.write_record_at(false, Tid::new(2), b"v2", &guard);
        r.unlock();
        assert!(out.grew);
        assert!(out.replacement.is_none());
        assert_eq!(r.chain_len(&guard), 2);

        // Snapshot-dependent visibility across the chain.
        assert_eq!(r.stable_read(Tid::new(1), &guard).unwrap().1, b"v1");
        assert_eq!(r.stable_read(Tid::new(2), &guard).unwrap().1, b"v2");
        assert_eq!(r.stable_read(Tid::new(9), &guard).unwrap().1, b"v2");
        assert!(r.stable_read(Tid::MIN, &guard).is_none());
    }

    #[test]
    fn oversized_write_replaces_head() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(4));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        r.lock();
        let _ = r.write_record_at(false, Tid::new(1), b"v1", &guard);

        let big = vec![0x5a_u8; 64];
        let out = r.write_record_at(false, Tid::new(2), &big, &guard);
        assert!(out.grew);
        let rep = out.replacement.expect("oversized spill must replace the head");
        assert!(!r.is_latest(), "old head demoted");

        let rep_shared = cell.store(rep, &guard);
        r.unlock();

        let rep_ref = unsafe { rep_shared.as_ref() }.unwrap();
        assert!(rep_ref.is_latest());
        assert_eq!(rep_ref.chain_len(&guard), 2);
        assert_eq!(rep_ref.stable_read(Tid::new(2), &guard).unwrap().1, big);
        assert_eq!(rep_ref.stable_read(Tid::new(1), &guard).unwrap().1, b"v1");

        // The demoted head refuses latest-required reads.
        assert!(r.stable_read(Tid::new(2), &guard).is_none());
    }

    #[test]
    fn validate_read_classifies() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(16));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        r.lock();
        let _ = r.write_record_at(false, Tid::new(3), b"x", &guard);
        r.unlock();

        assert_eq!(r.validate_read(Tid::new(5), Tid::new(3)), StableCheck::Ok);
        assert_eq!(
            r.validate_read(Tid::new(5), Tid::new(2)),
            StableCheck::Changed,
            "observed tid mismatch"
        );
        assert_eq!(
            r.validate_read(Tid::new(2), Tid::new(3)),
            StableCheck::Changed,
            "version beyond snapshot"
        );

        r.lock();
        assert_eq!(
            r.validate_read(Tid::new(5), Tid::new(3)),
            StableCheck::Unstable,
            "spin budget exhausts while locked"
        );
        r.unlock();
    }

    #[test]
    fn truncate_chain_releases_tail() {
        let guard = pinned();
        let cell = HeadCell::with_head(VersionRecord::alloc_first(16));
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();

        for i in 1..=6_u64 {
            r.lock();
            let out = r.write_record_at(false, Tid::new(i), format!("v{i}").as_bytes(), &guard);
            assert!(out.replacement.is_none());
            r.unlock();
        }
        assert_eq!(r.chain_len(&guard), 6);

        r.lock();
        let released = r.truncate_chain(3, &guard);
        r.unlock();
        assert_eq!(released, 3);
        assert_eq!(r.chain_len(&guard), 3);

        // Newest three survive, the rest read as missing.
        assert_eq!(r.stable_read(Tid::new(6), &guard).unwrap().1, b"v6");
        assert_eq!(r.stable_read(Tid::new(4), &guard).unwrap().1, b"v4");
        assert!(r.stable_read(Tid::new(3), &guard).is_none());
    }

    /// Readers racing an in-place writer never observe a torn value.
    #[test]
    fn no_torn_reads_under_overwrite() {
        let cell = HeadCell::with_head(VersionRecord::alloc_first(32));
        {
            let guard = pinned();
            let r = unsafe { cell.load(&guard).as_ref() }.unwrap();
            r.lock();
            let _ = r.write_record_at(false, Tid::new(1), &[1_u8; 32], &guard);
            r.unlock();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(5));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            let barrier = Arc::clone(&barrier);
            readers.push(thread::spawn(move || {
                barrier.wait();
                let mut reads = 0_u64;
                while !stop.load(Ordering::Relaxed) {
                    let guard = crossbeam_epoch::pin();
                    let r = unsafe { cell.load(&guard).as_ref() }.unwrap();
                    if let Some((tid, value)) = r.stable_read(Tid::MAX, &guard) {
                        assert_eq!(value.len(), 32);
                        let expect = (tid.get() & 0xff) as u8;
                        assert!(
                            value.iter().all(|&b| b == expect),
                            "torn read at {tid}: {value:?}"
                        );
                        reads += 1;
                    }
                }
                reads
            }));
        }

        let writer = {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut tid = 1_u64;
                while !stop.load(Ordering::Relaxed) {
                    tid += 1;
                    let guard = crossbeam_epoch::pin();
                    let r = unsafe { cell.load(&guard).as_ref() }.unwrap();
                    r.lock();
                    let fill = (tid & 0xff) as u8;
                    let out = r.write_record_at(true, Tid::new(tid), &[fill; 32], &guard);
                    assert!(out.replacement.is_none());
                    r.unlock();
                }
            })
        };

        thread::sleep(std::time::Duration::from_millis(300));
        stop.store(true, Ordering::Release);
        writer.join().unwrap();
        let total: u64 = readers.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0, "readers made progress");
    }

    /// The change counter strictly increases across lock/unlock pairs even
    /// under contention.
    #[test]
    fn change_counter_monotonic_under_contention() {
        let cell = HeadCell::with_head(VersionRecord::alloc_first(0));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let guard = crossbeam_epoch::pin();
                let r = unsafe { cell.load(&guard).as_ref() }.unwrap();
                for _ in 0..2000 {
                    r.lock();
                    r.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let guard = pinned();
        let r = unsafe { cell.load(&guard).as_ref() }.unwrap();
        assert_eq!(
            VersionRecord::change_count(r.stable_version()),
            4 * 2000,
            "every unlock bumps the counter exactly once"
        );
    }
}
