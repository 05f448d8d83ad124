//! Ordered key→value index with observable per-leaf version stamps.
//!
//! [`LeafMap`] is the non-transactional structure the transactional engine
//! stores record-chain heads in. It provides point lookup, insert-if-absent,
//! removal, and range scans. What makes it more than a sorted map is the
//! version stamp on every leaf:
//!
//! - Each leaf carries a 64-bit version split into two generations (see
//!   [`version_parts`]): the low half counts *inserts* into the leaf, the
//!   high half counts *structural* changes (remove, split). Replacing the
//!   value stored under an existing key bumps neither.
//! - A range scan reports, for every leaf it traverses, a [`LeafHandle`] and
//!   the version observed while the leaf's entries were read. The handle
//!   stays valid after the leaf is split or drained, so callers can re-read
//!   the version later and tell an insert apart from a reorganization.
//!
//! ## Structure
//!
//! A flat directory of sorted leaves: the directory maps a lower-bound key
//! to each leaf, and each leaf holds a small sorted run of entries. Leaves
//! split at [`MAX_LEAF_ENTRIES`]. The directory is guarded by a `RwLock`;
//! each leaf's entry run by its own `RwLock`. Lock order is always
//! directory → leaf.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Leaf fan-out before a split.
pub const MAX_LEAF_ENTRIES: usize = 16;

/// Split a leaf version stamp into its `(structure, insert)` generations.
///
/// The insert generation moves on every key added to the leaf; the
/// structure generation moves on removals and splits.
#[must_use]
pub const fn version_parts(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

// ---------------------------------------------------------------------------
// Leaf / LeafHandle
// ---------------------------------------------------------------------------

struct Leaf<V> {
    /// `(structure, insert)` generation pair packed per [`version_parts`].
    /// Bumped only while the entry lock is held for writing; readers sample
    /// it under the entry read lock, so a sampled version is always
    /// consistent with the entries seen.
    version: AtomicU64,
    entries: RwLock<Vec<(Box<[u8]>, V)>>,
}

impl<V> Leaf<V> {
    fn new(entries: Vec<(Box<[u8]>, V)>) -> Self {
        Self {
            version: AtomicU64::new(0),
            entries: RwLock::new(entries),
        }
    }

    /// Record an insert: bump the low generation, wrapping within its half.
    fn bump_insert(&self) {
        let v = self.version.load(Ordering::Relaxed);
        let low = (v as u32).wrapping_add(1);
        self.version
            .store((v & !0xffff_ffff) | u64::from(low), Ordering::Release);
    }

    /// Record a structural change (remove, split): bump the high generation.
    fn bump_structure(&self) {
        let v = self.version.load(Ordering::Relaxed);
        let high = ((v >> 32) as u32).wrapping_add(1);
        self.version
            .store((u64::from(high) << 32) | (v & 0xffff_ffff), Ordering::Release);
    }
}

/// Stable identity of one index leaf.
///
/// Handles compare and hash by leaf identity, not content, and keep the leaf
/// alive even after it is split away, so a stale handle can still answer
/// [`version`](LeafHandle::version) queries.
pub struct LeafHandle<V>(Arc<Leaf<V>>);

impl<V> LeafHandle<V> {
    /// Current version stamp of the leaf.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.0.version.load(Ordering::Acquire)
    }
}

impl<V> Clone for LeafHandle<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> PartialEq for LeafHandle<V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<V> Eq for LeafHandle<V> {}

impl<V> std::hash::Hash for LeafHandle<V> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl<V> std::fmt::Debug for LeafHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "leaf@{:p}(v{})", Arc::as_ptr(&self.0), self.version())
    }
}

// ---------------------------------------------------------------------------
// Range visitor
// ---------------------------------------------------------------------------

/// Callback surface of [`LeafMap::range_scan`].
///
/// For every leaf whose key span intersects the scanned range the map first
/// calls [`leaf`](RangeVisitor::leaf), then [`entry`](RangeVisitor::entry)
/// for each in-range entry in key order. Returning `false` from either stops
/// the scan.
pub trait RangeVisitor<V> {
    fn leaf(&mut self, handle: &LeafHandle<V>, version: u64) -> bool {
        let _ = (handle, version);
        true
    }

    fn entry(&mut self, key: &[u8], value: &V) -> bool;
}

/// Outcome of [`LeafMap::insert_if_absent`].
pub struct InsertOutcome<V> {
    /// The value now stored under the key: the new one if `inserted`, the
    /// pre-existing one otherwise.
    pub value: V,
    /// Whether this call inserted the key.
    pub inserted: bool,
    /// The leaf the key lives in (the leaf whose version was bumped, when
    /// `inserted`).
    pub leaf: LeafHandle<V>,
}

// ---------------------------------------------------------------------------
// LeafMap
// ---------------------------------------------------------------------------

/// Directory entry: lower bound of the leaf's key span.
struct DirSlot<V> {
    low: Box<[u8]>,
    leaf: Arc<Leaf<V>>,
}

/// Ordered map with per-leaf version stamps. See the module docs.
pub struct LeafMap<V> {
    dir: RwLock<Vec<DirSlot<V>>>,
}

impl<V: Clone> LeafMap<V> {
    /// Create an empty map with a single leaf spanning the whole key space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: RwLock::new(vec![DirSlot {
                low: Box::from(&[][..]),
                leaf: Arc::new(Leaf::new(Vec::new())),
            }]),
        }
    }

    /// Index into the directory of the leaf owning `key`.
    fn locate(dir: &[DirSlot<V>], key: &[u8]) -> usize {
        // First slot's bound is the empty key, so the partition point is >= 1.
        dir.partition_point(|slot| &*slot.low <= key) - 1
    }

    /// Point lookup.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<V> {
        let dir = self.dir.read();
        let leaf = &dir[Self::locate(&dir, key)].leaf;
        let entries = leaf.entries.read();
        entries
            .binary_search_by(|(k, _)| (**k).cmp(key))
            .ok()
            .map(|i| entries[i].1.clone())
    }

    /// Insert `key → value` unless the key is present.
    ///
    /// On a race, the first writer wins and the loser receives the winner's
    /// value with `inserted == false`.
    pub fn insert_if_absent(&self, key: &[u8], value: V) -> InsertOutcome<V> {
        loop {
            let dir = self.dir.read();
            let leaf = Arc::clone(&dir[Self::locate(&dir, key)].leaf);
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
                Ok(i) => {
                    return InsertOutcome {
                        value: entries[i].1.clone(),
                        inserted: false,
                        leaf: LeafHandle(Arc::clone(&leaf)),
                    };
                }
                Err(i) => {
                    if entries.len() >= MAX_LEAF_ENTRIES {
                        // Full leaf: drop the locks, split, retry.
                        drop(entries);
                        drop(dir);
                        self.split(&leaf);
                        continue;
                    }
                    entries.insert(i, (Box::from(key), value.clone()));
                    leaf.bump_insert();
                    drop(entries);
                    return InsertOutcome {
                        value,
                        inserted: true,
                        leaf: LeafHandle(leaf),
                    };
                }
            }
        }
    }

    /// Replace the value stored under an existing key without bumping the
    /// leaf version. Returns `false` if the key is absent.
    pub fn replace(&self, key: &[u8], value: V) -> bool {
        let dir = self.dir.read();
        let leaf = &dir[Self::locate(&dir, key)].leaf;
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
            Ok(i) => {
                entries[i].1 = value;
                true
            }
            Err(_) => false,
        }
    }

    /// Remove a key. Returns the removed value, if any.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Remove a key only if its current value satisfies `pred`, atomically
    /// with respect to concurrent leaf mutation. Returns the removed value.
    ///
    /// Lets a garbage collector remove exactly the entry it decided to
    /// collect, without clobbering a racing re-insertion.
    pub fn remove_if(&self, key: &[u8], pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let dir = self.dir.read();
        let leaf = &dir[Self::locate(&dir, key)].leaf;
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
            Ok(i) => {
                if !pred(&entries[i].1) {
                    return None;
                }
                let (_, v) = entries.remove(i);
                leaf.bump_structure();
                Some(v)
            }
            Err(_) => None,
        }
    }

    /// Split `leaf`, moving its upper half into a fresh leaf.
    ///
    /// Both halves get a version bump: the key set of each changed.
    fn split(&self, leaf: &Arc<Leaf<V>>) {
        let mut dir = self.dir.write();
        let Some(pos) = dir.iter().position(|slot| Arc::ptr_eq(&slot.leaf, leaf)) else {
            return; // already split away by a racing writer
        };
        let mut entries = leaf.entries.write();
        if entries.len() < MAX_LEAF_ENTRIES {
            return; // racing split already relieved the pressure
        }
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let low = upper[0].0.clone();
        let new_leaf = Arc::new(Leaf::new(upper));
        new_leaf.bump_structure();
        leaf.bump_structure();
        drop(entries);
        tracing::trace!(target: "mvkv.index", at = ?String::from_utf8_lossy(&low), "leaf split");
        dir.insert(pos + 1, DirSlot {
            low,
            leaf: new_leaf,
        });
    }

    /// Scan keys in `[lo, hi)` (`hi = None` means unbounded).
    ///
    /// Every leaf intersecting the range is reported to the visitor, even
    /// when it contributes no entries: an insert into such a leaf is still
    /// structural interference the caller may need to detect.
    pub fn range_scan<Vis: RangeVisitor<V>>(&self, lo: &[u8], hi: Option<&[u8]>, visitor: &mut Vis) {
        let dir = self.dir.read();
        let start = Self::locate(&dir, lo);
        for slot in &dir[start..] {
            if hi.is_some_and(|hi| &*slot.low >= hi) {
                break;
            }
            let leaf = &slot.leaf;
            let entries = leaf.entries.read();
            // Sampled under the read lock, so consistent with `entries`.
            let version = leaf.version.load(Ordering::Acquire);
            let handle = LeafHandle(Arc::clone(leaf));
            if !visitor.leaf(&handle, version) {
                return;
            }
            let from = entries.partition_point(|(k, _)| &**k < lo);
            for (k, v) in &entries[from..] {
                if hi.is_some_and(|hi| &**k >= hi) {
                    return;
                }
                if !visitor.entry(k, v) {
                    return;
                }
            }
        }
    }

    /// Total number of entries (full walk; diagnostics and tests).
    #[must_use]
    pub fn len(&self) -> usize {
        self.dir
            .read()
            .iter()
            .map(|slot| slot.leaf.entries.read().len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leaves (diagnostics and tests).
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.dir.read().len()
    }
}

impl<V: Clone> Default for LeafMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl<V> std::fmt::Debug for LeafMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMap")
            .field("leaves", &self.dir.read().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
