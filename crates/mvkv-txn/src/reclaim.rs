//! Grace-period reclamation for version records.
//!
//! A thin façade over `crossbeam-epoch` pin/defer so the engine can retire
//! records and schedule deferred work without touching raw epoch internals.
//! A [`PinGuard`] is constructed at transaction begin and dropped at
//! resolution: everything retired while any reader is pinned stays alive
//! until that reader unpins, which is exactly the grace-period contract the
//! optimistic chain reads require.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::Guard;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

static PINS_TOTAL: AtomicU64 = AtomicU64::new(0);
static UNPINS_TOTAL: AtomicU64 = AtomicU64::new(0);
static DEFERRED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of reclamation activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimMetrics {
    pub pins_total: u64,
    pub unpins_total: u64,
    pub deferred_total: u64,
}

/// Read current reclamation metrics.
#[must_use]
pub fn reclaim_metrics() -> ReclaimMetrics {
    ReclaimMetrics {
        pins_total: PINS_TOTAL.load(Ordering::Relaxed),
        unpins_total: UNPINS_TOTAL.load(Ordering::Relaxed),
        deferred_total: DEFERRED_TOTAL.load(Ordering::Relaxed),
    }
}

// ---------------------------------------------------------------------------
// Reclaimer / PinGuard
// ---------------------------------------------------------------------------

/// Handle to the reclamation domain.
///
/// Cardinality of active pins is bounded by in-flight transactions plus
/// short-lived GC pins, so a single relaxed counter is all the bookkeeping
/// needed.
#[derive(Debug, Default)]
pub struct Reclaimer {
    active_pins: AtomicU64,
}

impl Reclaimer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active_pins: AtomicU64::new(0),
        })
    }

    /// Pin the current thread into the reclamation domain.
    #[must_use]
    pub fn pin(self: &Arc<Self>) -> PinGuard {
        let active = self.active_pins.fetch_add(1, Ordering::Relaxed) + 1;
        PINS_TOTAL.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "mvkv.reclaim", active, "pinned");
        PinGuard {
            reclaimer: Arc::clone(self),
            guard: crossbeam_epoch::pin(),
        }
    }

    /// Number of currently active pins.
    #[must_use]
    pub fn active_pins(&self) -> u64 {
        self.active_pins.load(Ordering::Relaxed)
    }
}

/// A pinned read region.
///
/// While this guard lives, nothing retired after the pin can be freed, so
/// raw record pointers captured under it stay valid.
pub struct PinGuard {
    reclaimer: Arc<Reclaimer>,
    guard: Guard,
}

impl PinGuard {
    /// The underlying epoch guard, for chain traversal and retirement.
    #[must_use]
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Run `f` after a grace period: once every pin active right now has
    /// been dropped.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        DEFERRED_TOTAL.fetch_add(1, Ordering::Relaxed);
        self.guard.defer(f);
    }

    /// Push locally deferred work toward execution.
    pub fn flush(&self) {
        self.guard.flush();
    }

    /// The owning reclaimer.
    #[must_use]
    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.reclaimer.active_pins.fetch_sub(1, Ordering::Relaxed);
        UNPINS_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PinGuard(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pin_counts_balance() {
        let reclaimer = Reclaimer::new();
        assert_eq!(reclaimer.active_pins(), 0);
        {
            let _a = reclaimer.pin();
            let _b = reclaimer.pin();
            assert_eq!(reclaimer.active_pins(), 2);
        }
        assert_eq!(reclaimer.active_pins(), 0);
    }

    #[test]
    fn deferred_work_runs_after_unpin() {
        let reclaimer = Reclaimer::new();
        let dropped = Arc::new(AtomicUsize::new(0));

        {
            let pin = reclaimer.pin();
            let counter = DropCounter(Arc::clone(&dropped));
            pin.defer(move || drop(counter));
            pin.flush();
            assert_eq!(dropped.load(Ordering::SeqCst), 0, "deferred while pinned");
        }

        for _ in 0..64 {
            let pin = reclaimer.pin();
            pin.flush();
            drop(pin);
            if dropped.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metrics_count_pins_and_defers() {
        let before = reclaim_metrics();
        let reclaimer = Reclaimer::new();
        {
            let pin = reclaimer.pin();
            pin.defer(|| {});
        }
        let after = reclaim_metrics();
        assert!(after.pins_total > before.pins_total);
        assert!(after.unpins_total > before.unpins_total);
        assert!(after.deferred_total > before.deferred_total);
    }
}
