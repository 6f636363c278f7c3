//! Epoch-based deferred reclamation
//!
//! Logical unlink and physical drop are decoupled: structures hand garbage
//! (unlinked list nodes, superseded history wrappers, truncated MVCC chains)
//! to [`Reclaimer::retire`], which defers the drop through `crossbeam-epoch`
//! until every thread pinned at retire time has moved on.
//!
//! A crossbeam `Guard` is tied to its thread, so transactions do not hold
//! one. They carry an [`EpochTicket`] instead: a `Send` registration that
//! records when the reader started, so maintenance can report readers that
//! stay open for too long. Retiring pins the calling thread only for the
//! duration of the call.

use crossbeam_epoch as epoch;
use dashmap::DashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Type-erased garbage
pub type Garbage = Box<dyn Any + Send>;

/// Pin/flush rounds per [`Reclaimer::advance`]; a bag becomes reclaimable
/// two global epochs after it was sealed
const ADVANCE_ROUNDS: usize = 4;

/// Deferred-drop front end over the global crossbeam collector
pub struct Reclaimer {
    next_ticket: AtomicU64,
    tickets: DashMap<u64, Instant>,
    retired: AtomicU64,
    reclaimed: Arc<AtomicU64>,
}

impl Reclaimer {
    /// Reclaimer with nothing retired
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(1),
            tickets: DashMap::new(),
            retired: AtomicU64::new(0),
            reclaimed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a reader until the ticket is dropped
    pub fn pin(self: &Arc<Self>) -> EpochTicket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let pinned_at = Instant::now();
        self.tickets.insert(id, pinned_at);
        EpochTicket {
            reclaimer: Arc::clone(self),
            id,
            pinned_at,
        }
    }

    /// Defer dropping `garbage` until no pinned thread can observe it
    pub fn retire(&self, garbage: Garbage) {
        self.retire_all(std::iter::once(garbage));
    }

    /// Retire a batch under one pin
    pub fn retire_all(&self, garbage: impl IntoIterator<Item = Garbage>) {
        let items: Vec<Garbage> = garbage.into_iter().collect();
        if items.is_empty() {
            return;
        }
        let count = items.len() as u64;
        self.retired.fetch_add(count, Ordering::Relaxed);
        let reclaimed = Arc::clone(&self.reclaimed);
        let guard = epoch::pin();
        guard.defer(move || {
            drop(items);
            reclaimed.fetch_add(count, Ordering::Relaxed);
        });
        guard.flush();
    }

    /// Push deferred garbage toward execution and try to move the global
    /// epoch forward
    ///
    /// Returns the number of items this reclaimer saw dropped meanwhile,
    /// which may include drops run by other threads.
    pub fn advance(&self) -> usize {
        let before = self.reclaimed.load(Ordering::Acquire);
        for _ in 0..ADVANCE_ROUNDS {
            epoch::pin().flush();
        }
        let dropped = self.reclaimed.load(Ordering::Acquire).saturating_sub(before) as usize;
        if dropped > 0 {
            trace!(dropped, pending = self.pending(), "epoch reclaimed");
        }
        dropped
    }

    /// Garbage retired but not yet dropped
    pub fn pending(&self) -> usize {
        let (retired, reclaimed) = self.stats();
        retired.saturating_sub(reclaimed) as usize
    }

    /// Number of live tickets
    pub fn pinned(&self) -> usize {
        self.tickets.len()
    }

    /// Age of the longest-held ticket
    pub fn oldest_pin(&self) -> Option<Duration> {
        let now = Instant::now();
        self.tickets
            .iter()
            .map(|e| now.saturating_duration_since(*e.value()))
            .max()
    }

    /// Warn about every ticket held longer than `after`
    ///
    /// Returns the number of warnings emitted.
    pub fn warn_on_stale_readers(&self, after: Duration) -> usize {
        let now = Instant::now();
        let mut warned = 0;
        for entry in self.tickets.iter() {
            let held = now.saturating_duration_since(*entry.value());
            if held >= after {
                warn!(
                    ticket = *entry.key(),
                    held_ms = held.as_millis() as u64,
                    "long-running reader is holding back reclamation"
                );
                warned += 1;
            }
        }
        warned
    }

    /// Lifetime counters: (retired, reclaimed)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.retired.load(Ordering::Relaxed),
            self.reclaimed.load(Ordering::Relaxed),
        )
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("pinned", &self.pinned())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Reader registration on a [`Reclaimer`]; released on drop
pub struct EpochTicket {
    reclaimer: Arc<Reclaimer>,
    id: u64,
    pinned_at: Instant,
}

impl EpochTicket {
    /// Stable id for diagnostics
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since registration
    pub fn held_for(&self) -> Duration {
        self.pinned_at.elapsed()
    }
}

impl Drop for EpochTicket {
    fn drop(&mut self) {
        self.reclaimer.tickets.remove(&self.id);
    }
}

impl std::fmt::Debug for EpochTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTicket")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}
