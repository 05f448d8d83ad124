//! Foundation types shared across the mvkv engine crates.
//!
//! Runtime machinery (version records, transactions, protocols) lives in
//! `mvkv-txn`; this crate only defines the vocabulary those layers speak.

use std::fmt;

/// Transaction identifier / commit timestamp.
///
/// A `Tid` is an unsigned 64-bit value with two reserved points
/// ([`Tid::MIN`], [`Tid::MAX`]). How the intermediate bits are carved up is a
/// property of the commit protocol: the global-counter protocol treats the
/// whole word as one counter, while the epoch/core protocol packs a
/// `(core, serial, epoch)` triple into it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Tid(u64);

impl Tid {
    /// The timestamp carried by every freshly allocated chain head.
    pub const MIN: Self = Self(0);

    /// Sentinel greater than every assignable commit timestamp.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid#{}", self.0)
    }
}

/// Resolution state of a transaction.
///
/// `Embryo` means the transaction object exists but has performed no
/// operation yet; the first read/write/scan moves it to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TxnState {
    Embryo,
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    /// Whether the transaction has reached a terminal state.
    #[inline]
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Behavior flags fixed at transaction construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[repr(transparent)]
pub struct TxnFlags(u32);

impl TxnFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Validate scans through index-leaf version stamps instead of
    /// tracking absent key ranges.
    pub const LOW_LEVEL_SCAN: Self = Self(0x1);

    /// Reject writes; the transaction may only read and scan.
    pub const READ_ONLY: Self = Self(0x2);

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for TxnFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_ordering_and_sentinels() {
        assert!(Tid::MIN < Tid::new(1));
        assert!(Tid::new(u64::MAX - 1) < Tid::MAX);
        assert_eq!(Tid::new(7).get(), 7);
        assert_eq!(format!("{}", Tid::new(42)), "tid#42");
    }

    #[test]
    fn state_resolution() {
        assert!(!TxnState::Embryo.is_resolved());
        assert!(!TxnState::Active.is_resolved());
        assert!(TxnState::Committed.is_resolved());
        assert!(TxnState::Aborted.is_resolved());
    }

    #[test]
    fn flag_composition() {
        let f = TxnFlags::LOW_LEVEL_SCAN | TxnFlags::READ_ONLY;
        assert!(f.contains(TxnFlags::LOW_LEVEL_SCAN));
        assert!(f.contains(TxnFlags::READ_ONLY));
        assert!(!TxnFlags::NONE.contains(TxnFlags::READ_ONLY));
        assert_eq!(f.bits(), 0x3);
    }
}
