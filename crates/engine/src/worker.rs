//! Worker thread ids
//!
//! Version words record which worker holds their lock in a 7-bit field, so
//! each OS thread is assigned a small id the first time it begins a
//! transaction. Id 0 is reserved for non-transactional writers; transaction
//! ids cycle through `1..=max_threads`.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_core::ThreadId;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Sequence number of the calling thread, assigned on first use
pub fn thread_slot() -> usize {
    SLOT.with(|slot| match slot.get() {
        Some(s) => s,
        None => {
            let s = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(s));
            s
        }
    })
}

/// Worker id of the calling thread given `max_threads` distinct ids
///
/// Two threads may share an id once more than `max_threads` threads have
/// run transactions. Sharing only affects lock-owner diagnostics, never
/// correctness.
pub fn current_thread_id(max_threads: usize) -> ThreadId {
    debug_assert!(max_threads > 0);
    ThreadId::new(thread_slot() % max_threads + 1)
}
