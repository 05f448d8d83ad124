//! Engine event counters.
//!
//! Lock-free `AtomicU64` counters with `Relaxed` ordering; callers may see
//! stale values but never torn ones. Every abort is classified and counted
//! by reason.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use mvkv_error::AbortReason;

static ABORTS: [AtomicU64; 8] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

static COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static READ_DELETED_SEARCH_TOTAL: AtomicU64 = AtomicU64::new(0);
static READ_DELETED_SCAN_TOTAL: AtomicU64 = AtomicU64::new(0);
static CHAIN_TRUNCATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static VERSIONS_RELEASED_TOTAL: AtomicU64 = AtomicU64::new(0);
static DEFERRED_DELETES_TOTAL: AtomicU64 = AtomicU64::new(0);
static EPOCH_ADVANCES_TOTAL: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_commit() {
    COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_abort(reason: AbortReason) {
    ABORTS[reason.index()].fetch_add(1, Ordering::Relaxed);
}

/// A read located a record but found no stable visible version.
pub(crate) fn record_read_deleted_search() {
    READ_DELETED_SEARCH_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Same, during a range scan.
pub(crate) fn record_read_deleted_scan() {
    READ_DELETED_SCAN_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_truncation(versions_released: usize) {
    CHAIN_TRUNCATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
    VERSIONS_RELEASED_TOTAL.fetch_add(versions_released as u64, Ordering::Relaxed);
}

pub(crate) fn record_deferred_delete() {
    DEFERRED_DELETES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_epoch_advance() {
    EPOCH_ADVANCES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Number of aborts recorded for `reason`.
#[must_use]
pub fn aborts_for(reason: AbortReason) -> u64 {
    ABORTS[reason.index()].load(Ordering::Relaxed)
}

/// Snapshot of all engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub commits_total: u64,
    pub aborts_total: u64,
    pub aborts_by_reason: [u64; 8],
    pub read_deleted_search_total: u64,
    pub read_deleted_scan_total: u64,
    pub chain_truncations_total: u64,
    pub versions_released_total: u64,
    pub deferred_deletes_total: u64,
    pub epoch_advances_total: u64,
}

/// Read a point-in-time snapshot of the engine counters.
#[must_use]
pub fn engine_counters() -> EngineCounters {
    let aborts_by_reason = std::array::from_fn(|i| ABORTS[i].load(Ordering::Relaxed));
    EngineCounters {
        commits_total: COMMITS_TOTAL.load(Ordering::Relaxed),
        aborts_total: aborts_by_reason.iter().sum(),
        aborts_by_reason,
        read_deleted_search_total: READ_DELETED_SEARCH_TOTAL.load(Ordering::Relaxed),
        read_deleted_scan_total: READ_DELETED_SCAN_TOTAL.load(Ordering::Relaxed),
        chain_truncations_total: CHAIN_TRUNCATIONS_TOTAL.load(Ordering::Relaxed),
        versions_released_total: VERSIONS_RELEASED_TOTAL.load(Ordering::Relaxed),
        deferred_deletes_total: DEFERRED_DELETES_TOTAL.load(Ordering::Relaxed),
        epoch_advances_total: EPOCH_ADVANCES_TOTAL.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_counters_classify_by_reason() {
        let before = aborts_for(AbortReason::ReadNodeInterference);
        record_abort(AbortReason::ReadNodeInterference);
        record_abort(AbortReason::ReadNodeInterference);
        assert_eq!(aborts_for(AbortReason::ReadNodeInterference), before + 2);
    }

    #[test]
    fn snapshot_serializes() {
        record_commit();
        record_abort(AbortReason::User);
        let snap = engine_counters();
        assert!(snap.commits_total >= 1);
        assert!(snap.aborts_total >= 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"commits_total\""));
        assert!(json.contains("\"aborts_by_reason\""));
    }
}
