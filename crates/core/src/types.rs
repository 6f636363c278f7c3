//! Core types for the transactional memory engine
//!
//! This module defines the foundational types:
//! - Tid: Commit/read timestamp drawn from the global commit clock
//! - Sid: Snapshot identifier drawn from the global snapshot clock
//! - ThreadId: Small worker id stamped into locked version words

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commit / read timestamp
///
/// Drawn from [`CommitClock`](crate::clock::CommitClock). Values are
/// multiples of [`tid::INCREMENT_VALUE`](crate::version::tid::INCREMENT_VALUE)
/// so they can be stored directly in a version word without disturbing the
/// flag bits.
pub type Tid = u64;

/// Snapshot identifier
///
/// `0` means "live / non-snapshot read" when used as an active sid, and
/// "never committed" when stored on a snapshot wrapper.
pub type Sid = u64;

/// Sid value meaning "no snapshot" (live reads) or "not yet committed"
pub const INVALID_SNAPSHOT: Sid = 0;

/// Maximum number of distinct worker ids
///
/// Bounded by the 7-bit thread-id field of a version word.
pub const MAX_THREADS: usize = 128;

/// Identifier of the worker thread running a transaction
///
/// Stored in the low bits of a locked version word so a lock holder can be
/// identified. Lock ownership for protocol purposes is tracked on the
/// transaction item, so two threads sharing an id only affects diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u8);

impl ThreadId {
    /// Create a thread id
    ///
    /// # Panics
    /// Panics if `id >= MAX_THREADS`.
    pub fn new(id: usize) -> Self {
        assert!(id < MAX_THREADS, "thread id {} out of range", id);
        Self(id as u8)
    }

    /// Raw id as stored in a version word
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Raw id as an index
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self(0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:02}", self.0)
    }
}
