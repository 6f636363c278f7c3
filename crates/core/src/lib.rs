//! Core types and primitives for the Strata STM engine
//!
//! This crate defines the foundational pieces used throughout the system:
//! - Tid / Sid / ThreadId: timestamp, snapshot and worker identifiers
//! - TVersion: combined lock + version word
//! - Clocks: commit timestamp and global snapshot counters
//! - RwSpinLock, plus Backoff re-exported from crossbeam-utils
//! - StmError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod sync;
pub mod types;
pub mod version;

pub use clock::{Clocks, CommitClock, SnapshotClock, INITIAL_SID, INITIAL_TID};
pub use error::{AbortReason, StmError, StmResult};
pub use sync::{Backoff, RwSpinLock};
pub use types::{Sid, ThreadId, Tid, INVALID_SNAPSHOT, MAX_THREADS};
pub use version::{tid, TVersion};
