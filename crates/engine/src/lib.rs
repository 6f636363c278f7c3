//! Engine for the Strata STM
//!
//! This crate orchestrates the lower layers:
//! - Stm: clocks, transaction manager and reclaimer for one engine instance
//! - Transaction entry points with commit/abort handling and retry
//! - Snapshot registry and RAII snapshot guards
//! - Background maintenance (MVCC GC, history compaction, epoch reclamation)
//! - Configuration loaded from TOML

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod database;
pub mod worker;

pub use background::{
    CollectStats, MaintenanceStats, MaintenanceWorker, SnapshotCollectable,
};
pub use database::{
    RetryConfig, SnapshotGuard, Stm, StmConfig, StmStats, CONFIG_FILE_NAME,
};
pub use worker::current_thread_id;
