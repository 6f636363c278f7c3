//! Background maintenance
//!
//! One pass of maintenance does three things:
//! - truncates MVCC chains below the oldest in-flight read timestamp
//! - compacts snapshot history of every registered structure below the
//!   oldest live snapshot, unlinking nodes that are dead at every sid
//! - advances the reclamation epoch so retired memory is freed
//!
//! Passes run on demand through [`Stm::run_maintenance`] or periodically on
//! a [`MaintenanceWorker`] thread.

use crate::database::Stm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strata_concurrency::{MvGcStats, Reclaimer};
use strata_core::Sid;
use tracing::{error, info, trace};

/// Shortest sleep slice between shutdown checks
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// A structure keeping per-node snapshot history
pub trait SnapshotCollectable: Send + Sync {
    /// Drop history no snapshot at or after `horizon` can reach and unlink
    /// nodes deleted at every such snapshot
    ///
    /// Everything removed must go through `reclaimer`.
    fn collect_garbage(&self, horizon: Sid, reclaimer: &Reclaimer) -> CollectStats;
}

/// Outcome of one [`SnapshotCollectable::collect_garbage`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// History entries dropped
    pub compacted: usize,
    /// Nodes removed from the structure
    pub unlinked: usize,
}

impl std::ops::AddAssign for CollectStats {
    fn add_assign(&mut self, rhs: Self) {
        self.compacted += rhs.compacted;
        self.unlinked += rhs.unlinked;
    }
}

/// Outcome of one full maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Commit-timestamp horizon used for MVCC collection
    pub gc_horizon: u64,
    /// Snapshot horizon used for history compaction
    pub snapshot_horizon: Sid,
    /// MVCC registry pass
    pub mvcc: MvGcStats,
    /// Snapshot history pass, summed over every live structure
    pub history: CollectStats,
    /// Structures dropped from the collectable list because they were gone
    pub expired_collectables: usize,
    /// Retired objects freed by the epoch advance
    pub reclaimed: usize,
    /// Transactions open past the stale-reader threshold
    pub stale_readers: usize,
}

/// Periodic maintenance thread
///
/// Holds only a weak reference to the engine; the thread exits on shutdown
/// or once the engine is dropped.
pub struct MaintenanceWorker {
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl MaintenanceWorker {
    /// Worker running a pass every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the maintenance thread for `stm`
    pub fn start(&self, stm: Weak<Stm>) -> std::io::Result<JoinHandle<()>> {
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        thread::Builder::new()
            .name("strata-stm-maint".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "maintenance started");
                maintenance_loop(&stm, interval, &shutdown);
                info!("maintenance stopped");
            })
    }

    /// Signal the thread to exit after its current pass
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// True once [`shutdown`](Self::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn maintenance_loop(stm: &Weak<Stm>, interval: Duration, shutdown: &AtomicBool) {
    let slice = SHUTDOWN_POLL.min(interval);
    loop {
        // sleep first, in slices so shutdown is noticed promptly
        let mut elapsed = Duration::ZERO;
        while elapsed < interval {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(slice);
            elapsed += slice;
        }

        let Some(stm) = stm.upgrade() else {
            return;
        };
        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stm.run_maintenance()));
        match pass {
            Ok(stats) => trace!(
                truncated = stats.mvcc.truncated,
                compacted = stats.history.compacted,
                unlinked = stats.history.unlinked,
                reclaimed = stats.reclaimed,
                "background maintenance pass"
            ),
            Err(_) => error!("maintenance pass panicked; continuing"),
        }
    }
}
