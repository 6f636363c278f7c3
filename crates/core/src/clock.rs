//! Global clocks
//!
//! Two counters drive the engine:
//!
//! - [`CommitClock`] hands out commit timestamps. Values are spaced by
//!   [`INCREMENT_VALUE`] so they can be written straight into a version word.
//! - [`SnapshotClock`] holds the global snapshot counter (GSC). Taking a
//!   snapshot returns the current GSC and advances it; everything committed
//!   afterwards is stamped with a strictly larger sid.
//!
//! The snapshot clock is guarded by a reader/writer gate. Committing writers
//! that stamp snapshot ids hold the gate shared for the duration of their
//! install phase, and [`SnapshotClock::take_snapshot`] takes it exclusively,
//! so a snapshot never observes half of a commit.

use crate::sync::RwSpinLock;
use crate::types::{Sid, Tid};
use crate::version::tid::INCREMENT_VALUE;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// First commit timestamp handed out
pub const INITIAL_TID: Tid = 3 * INCREMENT_VALUE;

/// First snapshot id handed out
pub const INITIAL_SID: Sid = 1;

// ============================================================================
// CommitClock
// ============================================================================

/// Monotonic commit timestamp source
#[derive(Debug)]
pub struct CommitClock {
    counter: AtomicU64,
}

impl CommitClock {
    /// Clock starting at [`INITIAL_TID`]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(INITIAL_TID),
        }
    }

    /// Latest allocated timestamp; used as a transaction's read timestamp
    #[inline]
    pub fn current(&self) -> Tid {
        self.counter.load(Ordering::Acquire)
    }

    /// Allocate a fresh commit timestamp, strictly greater than every
    /// previously returned value
    #[inline]
    pub fn next(&self) -> Tid {
        self.counter.fetch_add(INCREMENT_VALUE, Ordering::AcqRel) + INCREMENT_VALUE
    }
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SnapshotClock
// ============================================================================

/// Global snapshot counter with its commit gate
#[derive(Debug)]
pub struct SnapshotClock {
    gsc: AtomicU64,
    gate: RwSpinLock,
}

impl SnapshotClock {
    /// Clock starting at [`INITIAL_SID`]
    pub fn new() -> Self {
        Self {
            gsc: AtomicU64::new(INITIAL_SID),
            gate: RwSpinLock::new(),
        }
    }

    /// Current global snapshot counter
    #[inline]
    pub fn current(&self) -> Sid {
        self.gsc.load(Ordering::Acquire)
    }

    /// Take a snapshot
    ///
    /// Waits for in-flight stamping commits to drain, returns the current
    /// GSC as the new snapshot id, and advances the GSC by one.
    pub fn take_snapshot(&self) -> Sid {
        let _gate = self.gate.write();
        self.gsc.fetch_add(1, Ordering::AcqRel)
    }

    /// Enter the gate shared and return the sid new versions must carry
    ///
    /// Must be paired with [`unlock_read_next_sid`](Self::unlock_read_next_sid).
    pub fn lock_read_next_sid(&self) -> Sid {
        self.gate.lock_read();
        self.current()
    }

    /// Leave the gate entered by [`lock_read_next_sid`](Self::lock_read_next_sid)
    pub fn unlock_read_next_sid(&self) {
        self.gate.unlock_read();
    }

    /// Number of committers currently inside the gate
    pub fn gate_readers(&self) -> u64 {
        self.gate.readers()
    }
}

impl Default for SnapshotClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Clock pair shared by an engine instance and every object it manages
#[derive(Debug, Default)]
pub struct Clocks {
    /// Commit timestamps
    pub commit: CommitClock,
    /// Snapshot ids
    pub snapshot: SnapshotClock,
}

static GLOBAL_CLOCKS: Lazy<Arc<Clocks>> = Lazy::new(|| Arc::new(Clocks::new()));

impl Clocks {
    /// Fresh, independent clock pair
    pub fn new() -> Self {
        Self {
            commit: CommitClock::new(),
            snapshot: SnapshotClock::new(),
        }
    }

    /// Process-wide clock pair
    pub fn global() -> Arc<Clocks> {
        Arc::clone(&GLOBAL_CLOCKS)
    }
}
