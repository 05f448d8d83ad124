//! Transaction-level error types.
//!
//! Every failure here is scoped to a single transaction, never to the
//! process: the engine classifies the abort, counts it, and hands the reason
//! back to the caller, who may retry the whole transaction.

use thiserror::Error;

/// Why a transaction was aborted.
///
/// Reasons are classified and counted; `as_str` gives the stable name used
/// in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum AbortReason {
    /// The caller invoked `abort`.
    User,
    /// A read could not obtain a stable record version within the spin
    /// budget, or a version change was observed mid-validation.
    UnstableRead,
    /// A read observed a version timestamp greater than the snapshot
    /// timestamp.
    FutureTidRead,
    /// Low-level scan mode: a scanned leaf's version changed because this
    /// transaction's own commit inserted into it.
    NodeScanWriteVersionChanged,
    /// Low-level scan mode: a scanned leaf's version changed due to a
    /// concurrent structural modification.
    NodeScanReadVersionChanged,
    /// Commit-time lock acquisition found the head record superseded.
    WriteNodeInterference,
    /// Read-set revalidation found the observed value or version had moved.
    ReadNodeInterference,
    /// A key range recorded as absent now contains a key.
    ReadAbsenceInterference,
}

impl AbortReason {
    /// All reasons, in classification order.
    pub const ALL: [Self; 8] = [
        Self::User,
        Self::UnstableRead,
        Self::FutureTidRead,
        Self::NodeScanWriteVersionChanged,
        Self::NodeScanReadVersionChanged,
        Self::WriteNodeInterference,
        Self::ReadNodeInterference,
        Self::ReadAbsenceInterference,
    ];

    /// Stable string form for logs and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::UnstableRead => "unstable_read",
            Self::FutureTidRead => "future_tid_read",
            Self::NodeScanWriteVersionChanged => "node_scan_write_version_changed",
            Self::NodeScanReadVersionChanged => "node_scan_read_version_changed",
            Self::WriteNodeInterference => "write_node_interference",
            Self::ReadNodeInterference => "read_node_interference",
            Self::ReadAbsenceInterference => "read_absence_interference",
        }
    }

    /// Dense index used by the per-reason counters.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::UnstableRead => 1,
            Self::FutureTidRead => 2,
            Self::NodeScanWriteVersionChanged => 3,
            Self::NodeScanReadVersionChanged => 4,
            Self::WriteNodeInterference => 5,
            Self::ReadNodeInterference => 6,
            Self::ReadAbsenceInterference => 7,
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surface of the transaction API.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnError {
    /// Write attempted on a transaction opened with the read-only flag.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Operation attempted after the transaction resolved.
    #[error("transaction already resolved (committed or aborted)")]
    Unusable,

    /// The transaction aborted; the reason says why.
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),
}

impl TxnError {
    /// The abort reason, if this error carries one.
    #[must_use]
    pub const fn abort_reason(self) -> Option<AbortReason> {
        match self {
            Self::Aborted(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for r in AbortReason::ALL {
            assert!(seen.insert(r.as_str()), "duplicate string for {r:?}");
        }
    }

    #[test]
    fn reason_indices_are_dense() {
        for (i, r) in AbortReason::ALL.iter().enumerate() {
            assert_eq!(r.index(), i);
        }
    }

    #[test]
    fn error_display() {
        let e = TxnError::Aborted(AbortReason::ReadAbsenceInterference);
        assert_eq!(
            e.to_string(),
            "transaction aborted: read_absence_interference"
        );
        assert_eq!(e.abort_reason(), Some(AbortReason::ReadAbsenceInterference));
        assert_eq!(TxnError::ReadOnly.abort_reason(), None);
    }
}
