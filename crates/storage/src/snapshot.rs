//! Live snapshot tracking
//!
//! History compaction may only drop versions no live snapshot can reach, so
//! every issued sid is tracked until released. The compaction horizon is the
//! oldest live sid, or the current global snapshot counter when none is live
//! (every snapshot issued later gets a sid at or above it).

use parking_lot::Mutex;
use std::collections::BTreeMap;
use strata_core::{Sid, SnapshotClock};
use tracing::trace;

/// Reference-counted set of live snapshot ids
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    live: Mutex<BTreeMap<Sid, usize>>,
}

impl SnapshotRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot on `clock` and track it
    ///
    /// The registry lock covers both steps so a concurrent horizon
    /// computation never misses the new sid.
    pub fn take(&self, clock: &SnapshotClock) -> Sid {
        let mut live = self.live.lock();
        let sid = clock.take_snapshot();
        *live.entry(sid).or_insert(0) += 1;
        trace!(sid, live = live.len(), "snapshot taken");
        sid
    }

    /// Track another holder of `sid`
    pub fn retain(&self, sid: Sid) {
        *self.live.lock().entry(sid).or_insert(0) += 1;
    }

    /// Drop one holder of `sid`
    ///
    /// Returns `false` if `sid` was not live.
    pub fn release(&self, sid: Sid) -> bool {
        let mut live = self.live.lock();
        match live.get_mut(&sid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                live.remove(&sid);
                trace!(sid, live = live.len(), "snapshot released");
                true
            }
            None => false,
        }
    }

    /// True if `sid` has at least one holder
    pub fn is_live(&self, sid: Sid) -> bool {
        self.live.lock().contains_key(&sid)
    }

    /// Oldest live sid
    pub fn oldest(&self) -> Option<Sid> {
        self.live.lock().keys().next().copied()
    }

    /// Number of distinct live sids
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Compaction horizon given `clock`
    pub fn horizon(&self, clock: &SnapshotClock) -> Sid {
        let live = self.live.lock();
        match live.keys().next() {
            Some(&oldest) => oldest,
            None => clock.current(),
        }
    }
}
