//! Version cells
//!
//! A [`TVersion`] is a single 64-bit word that acts as both a lock and a
//! monotonically increasing version stamp for a piece of shared data.
//!
//! ## Word Layout
//!
//! ```text
//!  63                                     9   8    7   6        0
//! +----------------------------------------+----+----+----------+
//! |            version counter             |USER|LOCK|  THREAD  |
//! +----------------------------------------+----+----+----------+
//! ```
//!
//! - `THREAD` (7 bits): id of the lock holder, only meaningful while locked
//! - `LOCK`: set while a committing transaction owns the cell
//! - `USER`: poison flag; marks a node inserted by an in-flight transaction
//! - counter: advances by [`tid::INCREMENT_VALUE`] per commit
//!
//! Version comparison ignores the lock and thread bits, so a reader that
//! observed a value before a writer locked the cell still validates as long
//! as the writer has not installed a new version.

use crate::sync::Backoff;
use crate::types::{ThreadId, Tid};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bit constants and pure helpers over raw version words
pub mod tid {
    use super::Tid;

    /// Thread id of the lock holder
    pub const THREADID_MASK: Tid = 0x7F;
    /// Cell is locked
    pub const LOCK_BIT: Tid = 1 << 7;
    /// Poison flag
    pub const USER_BIT: Tid = 1 << 8;
    /// Smallest step of the version counter
    pub const INCREMENT_VALUE: Tid = 1 << 9;
    /// Every non-counter bit
    pub const FLAGS_MASK: Tid = INCREMENT_VALUE - 1;

    /// True if the word has its lock bit set
    #[inline]
    pub const fn is_locked(v: Tid) -> bool {
        v & LOCK_BIT != 0
    }

    /// True if the word has its poison flag set
    #[inline]
    pub const fn is_user(v: Tid) -> bool {
        v & USER_BIT != 0
    }

    /// Lock-holder field of the word
    #[inline]
    pub const fn lock_owner(v: Tid) -> Tid {
        v & THREADID_MASK
    }

    /// Word with lock and thread bits cleared
    #[inline]
    pub const fn unlocked(v: Tid) -> Tid {
        v & !(LOCK_BIT | THREADID_MASK)
    }

    /// Counter portion of the word
    #[inline]
    pub const fn counter(v: Tid) -> Tid {
        v & !FLAGS_MASK
    }

    /// Compare two words ignoring lock and thread bits
    #[inline]
    pub const fn same_version(a: Tid, b: Tid) -> bool {
        unlocked(a) == unlocked(b)
    }

    /// Next counter value after `v`, preserving the poison flag
    #[inline]
    pub const fn next_version(v: Tid) -> Tid {
        unlocked(v) + INCREMENT_VALUE
    }
}

/// Lock + version word guarding a piece of shared state
///
/// All mutation of the guarded data happens while the lock bit is held; a
/// new version is published atomically together with the unlock.
pub struct TVersion {
    v: AtomicU64,
}

impl TVersion {
    /// Create a cell with the given initial word
    pub const fn new(initial: Tid) -> Self {
        Self {
            v: AtomicU64::new(initial),
        }
    }

    /// Create a cell already carrying the poison flag
    pub const fn new_invalid(initial: Tid) -> Self {
        Self::new(initial | tid::USER_BIT)
    }

    /// Current raw word
    #[inline]
    pub fn value(&self) -> Tid {
        self.v.load(Ordering::Acquire)
    }

    /// Attempt to take the lock once
    ///
    /// Returns `false` if another holder owns the cell.
    pub fn try_lock(&self, thread: ThreadId) -> bool {
        let cur = self.v.load(Ordering::Relaxed);
        if tid::is_locked(cur) {
            return false;
        }
        let locked = (cur & !tid::THREADID_MASK) | tid::LOCK_BIT | thread.as_u64();
        self.v
            .compare_exchange(cur, locked, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin (with backoff) until the lock is acquired
    pub fn lock(&self, thread: ThreadId) {
        let backoff = Backoff::new();
        while !self.try_lock(thread) {
            backoff.snooze();
        }
    }

    /// Release the lock without changing the version counter
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked version");
        self.v
            .fetch_and(!(tid::LOCK_BIT | tid::THREADID_MASK), Ordering::Release);
    }

    /// Publish `new_v` and release the lock in one store
    ///
    /// The lock and thread bits of `new_v` are ignored.
    pub fn set_version_unlock(&self, new_v: Tid) {
        debug_assert!(self.is_locked(), "set_version_unlock without lock");
        self.v.store(tid::unlocked(new_v), Ordering::Release);
    }

    /// Publish `new_v` while keeping the current lock state
    pub fn set_version(&self, new_v: Tid) {
        let cur = self.v.load(Ordering::Relaxed);
        let lock_part = cur & (tid::LOCK_BIT | tid::THREADID_MASK);
        self.v.store(tid::unlocked(new_v) | lock_part, Ordering::Release);
    }

    /// Advance the counter by one step and release the lock
    pub fn inc_version_unlock(&self) {
        let cur = self.v.load(Ordering::Relaxed);
        self.set_version_unlock(tid::next_version(cur));
    }

    /// True if the current word matches `observed` and the cell is either
    /// unlocked or locked by the validating transaction
    pub fn check_version(&self, observed: Tid, locked_by_me: bool) -> bool {
        let cur = self.value();
        tid::same_version(cur, observed) && (!tid::is_locked(cur) || locked_by_me)
    }

    /// True if any holder owns the lock
    #[inline]
    pub fn is_locked(&self) -> bool {
        tid::is_locked(self.value())
    }

    /// True if the lock is held with `thread` stamped as owner
    pub fn is_locked_here(&self, thread: ThreadId) -> bool {
        let cur = self.value();
        tid::is_locked(cur) && tid::lock_owner(cur) == thread.as_u64()
    }

    /// True if the lock is held by a thread other than `thread`
    pub fn is_locked_elsewhere(&self, thread: ThreadId) -> bool {
        let cur = self.value();
        tid::is_locked(cur) && tid::lock_owner(cur) != thread.as_u64()
    }

    /// Set the poison flag
    pub fn mark_invalid(&self) {
        self.v.fetch_or(tid::USER_BIT, Ordering::AcqRel);
    }

    /// Set the poison flag if the cell is neither locked nor already poisoned
    ///
    /// Returns `false` without changing the word otherwise.
    pub fn try_mark_invalid(&self) -> bool {
        let cur = self.v.load(Ordering::Relaxed);
        if tid::is_locked(cur) || tid::is_user(cur) {
            return false;
        }
        self.v
            .compare_exchange(cur, cur | tid::USER_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Clear the poison flag
    pub fn clear_invalid(&self) {
        self.v.fetch_and(!tid::USER_BIT, Ordering::AcqRel);
    }

    /// True if the poison flag is set
    #[inline]
    pub fn is_invalid(&self) -> bool {
        tid::is_user(self.value())
    }

    /// Read guarded data consistently
    ///
    /// Spins while the cell is locked, runs `f`, and retries until the word
    /// is unchanged across the call. Returns the observed word and `f`'s
    /// result.
    pub fn stable_read<R>(&self, mut f: impl FnMut() -> R) -> (Tid, R) {
        let backoff = Backoff::new();
        loop {
            let before = self.value();
            if tid::is_locked(before) {
                backoff.snooze();
                continue;
            }
            let result = f();
            if self.value() == before {
                return (before, result);
            }
            backoff.spin();
        }
    }
}

impl Default for TVersion {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for TVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.value();
        f.debug_struct("TVersion")
            .field("counter", &(tid::counter(v) / tid::INCREMENT_VALUE))
            .field("locked", &tid::is_locked(v))
            .field("owner", &tid::lock_owner(v))
            .field("invalid", &tid::is_user(v))
            .finish()
    }
}
