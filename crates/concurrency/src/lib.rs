//! Concurrency layer for the Strata STM engine
//!
//! This crate implements the commit machinery shared by every transactional
//! structure:
//! - TransItem / ItemKey: per-transaction (owner, key) item set
//! - TObject: participant contract (lock / check / install / unlock / cleanup)
//! - Transaction: explicit transaction context
//! - TransactionManager: OCC commit protocol and in-flight registry
//! - MvObject / MvHistory: MVCC history chains, MvRegistry for their GC
//! - Reclaimer: epoch-based deferred reclamation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod epoch;
pub mod item;
pub mod manager;
pub mod mvcc;
pub mod mvcc_registry;
pub mod participant;
pub mod transaction;

pub use epoch::{EpochTicket, Garbage, Reclaimer};
pub use item::{flags, owner_ident, ItemData, ItemKey, TransItem};
pub use manager::{CommitError, ManagerStats, TransactionManager};
pub use mvcc::{MvCollectOutcome, MvHistory, MvObject, MvStatus};
pub use mvcc_registry::{MvCollectable, MvGcStats, MvRegistry};
pub use participant::TObject;
pub use transaction::{Transaction, TransactionStatus};
