//! The mvkv transactional engine.
//!
//! An in-memory multi-version store: every key owns a newest-first chain of
//! version records, transactions read optimistically at a snapshot and
//! validate at commit, and one of two pluggable protocols assigns commit
//! timestamps and drives garbage collection:
//!
//! - [`GlobalTid`]: one global counter, totally ordered commit TIDs,
//!   spill-always writes with chain-length-bounded truncation.
//! - [`EpochCore`]: `(core, serial, epoch)` composite TIDs, an epoch
//!   advancer thread, same-epoch in-place overwrites, and per-epoch
//!   deferred GC work queues.
//!
//! ```
//! use std::sync::Arc;
//! use mvkv_txn::{GlobalTid, GlobalTidConfig, Transaction, TxnTable};
//! use mvkv_types::TxnFlags;
//!
//! let protocol = GlobalTid::new(GlobalTidConfig::default());
//! let table = TxnTable::new("accounts");
//!
//! let mut txn = Transaction::begin(&protocol, TxnFlags::NONE);
//! txn.write(&table, b"alice", b"100").unwrap();
//! assert!(txn.commit().unwrap());
//!
//! let mut txn = Transaction::begin(&protocol, TxnFlags::NONE);
//! assert_eq!(txn.read(&table, b"alice").unwrap().as_deref(), Some(&b"100"[..]));
//! assert!(txn.commit().unwrap());
//! ```

mod align;
mod context;
mod counters;
mod protocol;
mod proto_epoch;
mod proto_global;
mod range;
mod reclaim;
mod record;
mod table;
mod txn;

pub use counters::{EngineCounters, aborts_for, engine_counters};
pub use proto_epoch::{EpochCommitGuard, EpochConfig, EpochCore, EpochTxnHandle, SERIAL_BITS};
pub use proto_global::{GlobalTid, GlobalTidConfig, GlobalTxnHandle};
pub use protocol::Protocol;
pub use range::{AbsentRangeSet, KeyRange, key_successor};
pub use reclaim::{PinGuard, ReclaimMetrics, Reclaimer, reclaim_metrics};
pub use record::{HeadCell, HeadRef, STABLE_READ_SPINS, StableCheck, VersionRecord, WriteOutcome};
pub use table::TxnTable;
pub use txn::Transaction;

pub use mvkv_error::{AbortReason, TxnError};
pub use mvkv_types::{Tid, TxnFlags, TxnState};
