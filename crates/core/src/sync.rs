//! Spin primitives
//!
//! - [`Backoff`]: spin-then-yield helper from `crossbeam-utils`
//! - [`RwSpinLock`]: writer-preferring reader/writer spin lock used as the
//!   snapshot gate

pub use crossbeam_utils::Backoff;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// RwSpinLock
// ============================================================================

const WRITER: u64 = 1 << 63;
const READERS_MASK: u64 = WRITER - 1;

/// Writer-preferring reader/writer spin lock
///
/// A pending writer sets the writer bit first, which blocks new readers, and
/// then waits for the reader count to drain.
#[derive(Debug, Default)]
pub struct RwSpinLock {
    state: CachePadded<AtomicU64>,
}

impl RwSpinLock {
    /// Unlocked gate
    pub const fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Acquire shared access
    pub fn lock_read(&self) {
        let backoff = Backoff::new();
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Release shared access
    pub fn unlock_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READERS_MASK > 0, "unlock_read without readers");
    }

    /// Acquire exclusive access
    pub fn lock_write(&self) {
        let backoff = Backoff::new();
        // claim the writer bit
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur | WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            backoff.snooze();
        }
        // drain readers
        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) & READERS_MASK != 0 {
            backoff.snooze();
        }
    }

    /// Release exclusive access
    pub fn unlock_write(&self) {
        let prev = self.state.fetch_and(!WRITER, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "unlock_write without writer");
    }

    /// Number of readers currently inside
    pub fn readers(&self) -> u64 {
        self.state.load(Ordering::Relaxed) & READERS_MASK
    }

    /// True while a writer holds or is acquiring the gate
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Shared access released on drop
    pub fn read(&self) -> ReadGuard<'_> {
        self.lock_read();
        ReadGuard { lock: self }
    }

    /// Exclusive access released on drop
    pub fn write(&self) -> WriteGuard<'_> {
        self.lock_write();
        WriteGuard { lock: self }
    }
}

/// RAII shared guard for [`RwSpinLock`]
#[must_use]
pub struct ReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// RAII exclusive guard for [`RwSpinLock`]
#[must_use]
pub struct WriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
