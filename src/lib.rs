//! Strata STM - in-process software transactional memory
//!
//! Strata STM lets threads compose reads and writes over shared
//! transactional objects into atomic, isolated transactions, and take
//! point-in-time snapshots that stay readable while writers keep committing.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_stm::{Stm, TSortedList, TBox};
//!
//! let stm = Stm::in_memory();
//! let list = TSortedList::new(&stm);
//! let count = TBox::new(0u64);
//!
//! stm.atomically(|txn| {
//!     list.trans_insert(txn, 1, "one")?;
//!     count.modify(txn, |c| c + 1)?;
//!     Ok(())
//! })?;
//!
//! let snap = stm.take_snapshot();
//! stm.atomically(|txn| list.trans_erase(txn, &1))?;
//! assert_eq!(list.snapshot_find(&1, snap.sid()), Some("one"));
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: version words, clocks, errors
//! - `strata-concurrency`: transaction items, commit protocol, MVCC chains,
//!   epoch reclamation
//! - `strata-storage`: snapshot histories and object handles
//! - `strata-engine`: the [`Stm`] instance, retries, snapshots, maintenance
//! - `strata-primitives`: [`TSortedList`], [`TBox`], [`MvBox`]

pub use strata_concurrency::{
    ItemKey, MvObject, Reclaimer, TObject, TransItem, Transaction, TransactionManager,
    TransactionStatus,
};
pub use strata_core::{
    tid, AbortReason, Clocks, Sid, StmError, StmResult, TVersion, ThreadId, Tid, INVALID_SNAPSHOT,
    MAX_THREADS,
};
pub use strata_engine::{
    CollectStats, MaintenanceStats, RetryConfig, SnapshotCollectable, SnapshotGuard, Stm,
    StmConfig, StmStats, CONFIG_FILE_NAME,
};
pub use strata_primitives::{MvBox, TBox, TSortedList};
pub use strata_storage::{NodeBase, ObjectId, SnapshotRegistry};
