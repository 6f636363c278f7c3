//! Registry of MVCC objects for garbage collection
//!
//! Objects register a weak handle on creation. A collection pass walks the
//! registry, truncates each chain below the oldest read timestamp still in
//! use, and fires the delete callback of objects whose visible version is a
//! deletion. Entries leave the registry only once their owner is dropped;
//! a deleted object can be written again and its history must keep being
//! collected.

use crate::epoch::Reclaimer;
use crate::mvcc::{MvCollectOutcome, MvObject};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use strata_core::Tid;
use tracing::trace;

/// Anything that owns history chains
pub trait MvCollectable: Send + Sync {
    /// Truncate history unreachable from `horizon` onwards
    fn collect(&self, horizon: Tid, reclaimer: &Reclaimer) -> MvCollectOutcome;
}

impl<T: Send + Sync + 'static> MvCollectable for MvObject<T> {
    fn collect(&self, horizon: Tid, reclaimer: &Reclaimer) -> MvCollectOutcome {
        MvObject::collect(self, horizon, reclaimer)
    }
}

/// Aggregate result of one registry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MvGcStats {
    /// Live objects visited
    pub visited: usize,
    /// History nodes cut
    pub truncated: usize,
    /// Objects whose delete callback fired on this pass
    pub deleted: usize,
    /// Entries dropped because the owner was gone
    pub expired: usize,
}

/// Weak registry of collectable objects
#[derive(Default)]
pub struct MvRegistry {
    entries: Mutex<Vec<Weak<dyn MvCollectable>>>,
}

impl MvRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `obj` until it is dropped
    pub fn register(&self, obj: &Arc<dyn MvCollectable>) {
        self.entries.lock().push(Arc::downgrade(obj));
    }

    /// Number of tracked entries, live or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one collection pass at `horizon`
    pub fn collect(&self, horizon: Tid, reclaimer: &Reclaimer) -> MvGcStats {
        // snapshot the entries so collection runs without the registry lock
        let entries: Vec<Weak<dyn MvCollectable>> = self.entries.lock().clone();
        let mut stats = MvGcStats::default();
        let mut dead: Vec<*const ()> = Vec::new();

        for weak in &entries {
            match weak.upgrade() {
                Some(obj) => {
                    stats.visited += 1;
                    let out = obj.collect(horizon, reclaimer);
                    stats.truncated += out.truncated;
                    stats.deleted += usize::from(out.deleted);
                }
                None => {
                    stats.expired += 1;
                    dead.push(weak.as_ptr() as *const ());
                }
            }
        }

        if !dead.is_empty() {
            self.entries
                .lock()
                .retain(|w| !dead.contains(&(w.as_ptr() as *const ())));
        }
        trace!(
            horizon,
            visited = stats.visited,
            truncated = stats.truncated,
            deleted = stats.deleted,
            "mvcc gc pass"
        );
        stats
    }
}

impl std::fmt::Debug for MvRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
