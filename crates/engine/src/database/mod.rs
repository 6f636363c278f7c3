//! Stm struct and transaction entry points
//!
//! This module provides the engine that ties the lower layers together:
//! - Clock pair, transaction manager and epoch reclaimer
//! - Snapshot registry with RAII guards
//! - Registries of MVCC objects and snapshot-history structures for GC
//! - Optional background maintenance thread
//!
//! ## Transaction API
//!
//! 1. **Closure API** (recommended): `stm.transaction(|txn| { ... })`
//!    - Automatic commit on success, abort on error
//!    - Returns the closure's return value
//!
//! 2. **Retry API**: `stm.transaction_with_retry(&config, |txn| { ... })` or
//!    `stm.atomically(|txn| { ... })`
//!    - Re-runs the body from scratch after every conflict abort
//!
//! 3. **Manual API**: `begin()` + `Transaction::commit()`
//!    - For cases requiring external control over commit timing

pub mod config;
mod transactions;

pub use config::{StmConfig, CONFIG_FILE_NAME};
pub use transactions::RetryConfig;

use crate::background::{CollectStats, MaintenanceStats, MaintenanceWorker, SnapshotCollectable};
use crate::worker::current_thread_id;
use parking_lot::Mutex as ParkingMutex;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use strata_concurrency::{
    ManagerStats, MvCollectable, MvRegistry, Reclaimer, Transaction, TransactionManager,
};
use strata_core::{AbortReason, Clocks, Sid, StmError, StmResult, ThreadId, Tid};
use strata_storage::SnapshotRegistry;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Stm Struct
// ============================================================================

/// Software transactional memory engine
///
/// Every transactional structure created against an `Stm` shares its clocks,
/// so commits across structures are totally ordered and snapshots cut across
/// all of them consistently.
///
/// # Example
///
/// ```text
/// use strata_engine::{Stm, StmConfig};
///
/// let stm = Stm::new(StmConfig::default())?;
/// let total = stm.atomically(|txn| {
///     let a = account_a.read(txn)?;
///     let b = account_b.read(txn)?;
///     Ok(a + b)
/// })?;
/// ```
pub struct Stm {
    config: StmConfig,
    clocks: Arc<Clocks>,
    reclaimer: Arc<Reclaimer>,
    manager: Arc<TransactionManager>,
    mv_registry: MvRegistry,
    snapshots: SnapshotRegistry,
    collectables: ParkingMutex<Vec<Weak<dyn SnapshotCollectable>>>,
    maintenance: ParkingMutex<Option<(MaintenanceWorker, JoinHandle<()>)>>,
}

/// Engine-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmStats {
    /// Commit/abort counters
    pub transactions: ManagerStats,
    /// Transactions currently in flight
    pub active_transactions: usize,
    /// Distinct live snapshot ids
    pub live_snapshots: usize,
    /// Retired objects waiting for the epoch to advance
    pub pending_garbage: usize,
    /// MVCC objects tracked for collection
    pub mv_objects: usize,
    /// Snapshot-history structures tracked for collection
    pub collectables: usize,
}

impl Stm {
    /// Create an engine with its own clocks
    ///
    /// Starts the maintenance thread when `background_maintenance` is set.
    ///
    /// # Errors
    ///
    /// Returns `StmError::Config` if `config` fails validation, or
    /// `StmError::InvalidState` if the maintenance thread cannot be spawned.
    pub fn new(config: StmConfig) -> StmResult<Arc<Self>> {
        Self::with_clocks(config, Arc::new(Clocks::new()))
    }

    /// Create an engine over an existing clock pair
    ///
    /// Pass [`Clocks::global`] to share timestamps with every other engine in
    /// the process.
    pub fn with_clocks(config: StmConfig, clocks: Arc<Clocks>) -> StmResult<Arc<Self>> {
        config.validate()?;
        let reclaimer = Arc::new(Reclaimer::new());
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&clocks),
            Arc::clone(&reclaimer),
        ));
        let stm = Arc::new(Self {
            config,
            clocks,
            reclaimer,
            manager,
            mv_registry: MvRegistry::new(),
            snapshots: SnapshotRegistry::new(),
            collectables: ParkingMutex::new(Vec::new()),
            maintenance: ParkingMutex::new(None),
        });
        if stm.config.background_maintenance {
            stm.start_maintenance()?;
        }
        debug!(
            max_threads = stm.config.max_threads,
            background = stm.config.background_maintenance,
            "stm engine created"
        );
        Ok(stm)
    }

    /// Engine with default configuration and no background thread
    pub fn in_memory() -> Arc<Self> {
        let config = StmConfig {
            background_maintenance: false,
            ..StmConfig::default()
        };
        match Self::with_clocks(config, Arc::new(Clocks::new())) {
            Ok(stm) => stm,
            Err(e) => unreachable!("default config rejected: {}", e),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Active configuration
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Clock pair shared with every object of this engine
    pub fn clocks(&self) -> &Arc<Clocks> {
        &self.clocks
    }

    /// Deferred reclamation queue
    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    /// Transaction manager running the commit protocol
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Worker id of the calling thread
    pub fn thread_id(&self) -> ThreadId {
        current_thread_id(self.config.max_threads)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction on the calling thread's worker id
    pub fn begin(&self) -> Transaction {
        self.manager.begin(self.thread_id())
    }

    /// Begin a transaction under an explicit worker id
    pub fn begin_with(&self, thread: ThreadId) -> Transaction {
        self.manager.begin(thread)
    }

    /// Begin a transaction whose reads resolve at snapshot `sid`
    ///
    /// Snapshot-scoped transactions are read-only; transactional structures
    /// reject writes staged in them.
    pub fn begin_at(&self, sid: Sid) -> Transaction {
        let mut txn = self.begin();
        txn.set_active_sid(sid);
        txn
    }

    /// Execute a closure within a transaction
    ///
    /// Commits if the closure returns `Ok`, aborts if it returns `Err`.
    /// No retry: a conflict surfaces as `StmError::Aborted`.
    pub fn transaction<F, T>(&self, f: F) -> StmResult<T>
    where
        F: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        let mut txn = self.begin();
        let result = f(&mut txn);
        Self::run_single_attempt(&mut txn, result)
    }

    /// Execute a transaction with automatic retry on conflict
    ///
    /// The closure is called repeatedly until either:
    /// - The transaction commits successfully
    /// - A non-conflict error occurs (not retried)
    /// - `config.max_retries` retries have been spent
    ///
    /// Each attempt runs in a fresh transaction, so the body must not carry
    /// state from a failed attempt into the next one.
    ///
    /// # Errors
    ///
    /// `StmError::RetryLimitExceeded` once retries are exhausted; any
    /// non-conflict error from the body or the commit unchanged.
    pub fn transaction_with_retry<F, T>(&self, config: &RetryConfig, mut f: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        let mut attempt = 0usize;
        loop {
            let mut txn = self.begin();
            let result = f(&mut txn);
            let outcome = Self::run_single_attempt(&mut txn, result);
            drop(txn);

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() => {
                    let reason = e.abort_reason().cloned().unwrap_or(AbortReason::User);
                    if attempt >= config.max_retries {
                        warn!(attempts = attempt + 1, %reason, "transaction retry limit exceeded");
                        return Err(StmError::RetryLimitExceeded {
                            attempts: attempt + 1,
                            last_reason: reason,
                        });
                    }
                    trace!(attempt, %reason, "retrying transaction");
                    let delay = config.calculate_delay(attempt);
                    if delay.is_zero() {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// [`transaction_with_retry`](Self::transaction_with_retry) under the
    /// configured retry policy
    pub fn atomically<F, T>(&self, f: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        self.transaction_with_retry(&self.config.retry, f)
    }

    fn run_single_attempt<T>(txn: &mut Transaction, result: StmResult<T>) -> StmResult<T> {
        match result {
            Ok(value) => {
                // the body may have swallowed an abort raised by an operation
                if let Some(reason) = txn.abort_reason() {
                    return Err(StmError::aborted(reason.clone()));
                }
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if txn.is_active() {
                    let reason = e.abort_reason().cloned().unwrap_or(AbortReason::User);
                    let _ = txn.abort(reason);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Take a snapshot, released when the guard drops
    pub fn take_snapshot(&self) -> SnapshotGuard<'_> {
        SnapshotGuard {
            stm: self,
            sid: self.take_snapshot_id(),
        }
    }

    /// Take a snapshot and return its raw id
    ///
    /// The id stays live, holding back history compaction, until
    /// [`release_snapshot`](Self::release_snapshot) is called for it.
    pub fn take_snapshot_id(&self) -> Sid {
        self.snapshots.take(&self.clocks.snapshot)
    }

    /// Release a snapshot taken with [`take_snapshot_id`](Self::take_snapshot_id)
    ///
    /// Returns `false` if `sid` was not live.
    pub fn release_snapshot(&self, sid: Sid) -> bool {
        self.snapshots.release(sid)
    }

    /// Oldest sid history compaction must preserve
    pub fn snapshot_horizon(&self) -> Sid {
        self.snapshots.horizon(&self.clocks.snapshot)
    }

    /// Oldest read timestamp an in-flight transaction may still resolve
    pub fn gc_horizon(&self) -> Tid {
        self.manager.gc_horizon()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Track an MVCC object for chain truncation
    pub fn register_mv(&self, obj: &Arc<dyn MvCollectable>) {
        self.mv_registry.register(obj);
    }

    /// Track a snapshot-history structure for compaction
    ///
    /// Only a weak handle is kept; dropping the structure unregisters it.
    pub fn register_collectable(&self, obj: &Arc<dyn SnapshotCollectable>) {
        self.collectables.lock().push(Arc::downgrade(obj));
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one maintenance pass on the calling thread
    pub fn run_maintenance(&self) -> MaintenanceStats {
        let gc_horizon = self.gc_horizon();
        let mvcc = self.mv_registry.collect(gc_horizon, &self.reclaimer);

        let (live, expired) = {
            let mut entries = self.collectables.lock();
            let before = entries.len();
            let mut live = Vec::with_capacity(before);
            entries.retain(|weak| match weak.upgrade() {
                Some(obj) => {
                    live.push(obj);
                    true
                }
                None => false,
            });
            (live, before - entries.len())
        };

        let snapshot_horizon = self.snapshot_horizon();
        let mut history = CollectStats::default();
        for obj in &live {
            history += obj.collect_garbage(snapshot_horizon, &self.reclaimer);
        }
        drop(live);

        let reclaimed = self.reclaimer.advance();
        let stale_readers = self
            .reclaimer
            .warn_on_stale_readers(Duration::from_millis(self.config.stale_reader_warn_ms));
        trace!(
            gc_horizon,
            snapshot_horizon,
            truncated = mvcc.truncated,
            compacted = history.compacted,
            unlinked = history.unlinked,
            reclaimed,
            "maintenance pass"
        );
        MaintenanceStats {
            gc_horizon,
            snapshot_horizon,
            mvcc,
            history,
            expired_collectables: expired,
            reclaimed,
            stale_readers,
        }
    }

    /// Start the background maintenance thread
    ///
    /// A no-op if it is already running.
    pub fn start_maintenance(self: &Arc<Self>) -> StmResult<()> {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return Ok(());
        }
        let worker = MaintenanceWorker::new(Duration::from_millis(self.config.maintenance_interval_ms));
        let handle = worker
            .start(Arc::downgrade(self))
            .map_err(|e| StmError::InvalidState {
                state: format!("failed to spawn maintenance thread: {}", e),
            })?;
        *slot = Some((worker, handle));
        Ok(())
    }

    /// Stop the background maintenance thread and wait for it to exit
    ///
    /// Returns `false` if it was not running.
    pub fn stop_maintenance(&self) -> bool {
        let Some((worker, handle)) = self.maintenance.lock().take() else {
            return false;
        };
        worker.shutdown();
        // the last engine handle may be dropped by the worker itself
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
        true
    }

    /// True while the maintenance thread is running
    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance.lock().is_some()
    }

    /// Engine-wide counters
    pub fn stats(&self) -> StmStats {
        StmStats {
            transactions: self.manager.stats(),
            active_transactions: self.manager.active_count(),
            live_snapshots: self.snapshots.live_count(),
            pending_garbage: self.reclaimer.pending(),
            mv_objects: self.mv_registry.len(),
            collectables: self.collectables.lock().len(),
        }
    }
}

impl Drop for Stm {
    fn drop(&mut self) {
        if self.stop_maintenance() {
            info!("stm engine dropped; maintenance stopped");
        }
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("config", &self.config)
            .field("commit_clock", &self.clocks.commit.current())
            .field("snapshot_clock", &self.clocks.snapshot.current())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// SnapshotGuard
// ============================================================================

/// Live snapshot; released on drop
pub struct SnapshotGuard<'a> {
    stm: &'a Stm,
    sid: Sid,
}

impl SnapshotGuard<'_> {
    /// Snapshot id
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Begin a read-only transaction at this snapshot
    pub fn begin(&self) -> Transaction {
        self.stm.begin_at(self.sid)
    }

    /// Run `f` in a transaction reading at this snapshot
    pub fn read<F, T>(&self, f: F) -> StmResult<T>
    where
        F: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        let mut txn = self.begin();
        let result = f(&mut txn);
        Stm::run_single_attempt(&mut txn, result)
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.stm.release_snapshot(self.sid);
    }
}

impl std::fmt::Debug for SnapshotGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGuard").field("sid", &self.sid).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use strata_concurrency::{ItemKey, MvObject, TObject, TransItem};
    use strata_core::{tid, TVersion};

    const KEY: ItemKey = ItemKey::Const(0);

    /// OCC cell holding a u64
    struct Cell {
        version: TVersion,
        value: AtomicU64,
    }

    impl Cell {
        fn new(v: u64) -> Arc<Self> {
            Arc::new(Self {
                version: TVersion::new(tid::INCREMENT_VALUE),
                value: AtomicU64::new(v),
            })
        }

        fn read(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<u64> {
            let owner: Arc<dyn TObject> = self.clone();
            if let Some(v) = txn
                .check_item(&owner, &KEY)
                .and_then(|i| i.write_value::<u64>())
            {
                return Ok(*v);
            }
            let (ver, val) = self
                .version
                .stable_read(|| self.value.load(Ordering::Relaxed));
            if !txn.item(&owner, KEY).observe(ver) {
                return Err(txn.abort(AbortReason::ValidationFailed));
            }
            Ok(val)
        }

        fn write(self: &Arc<Self>, txn: &mut Transaction, v: u64) {
            let owner: Arc<dyn TObject> = self.clone();
            txn.item(&owner, KEY).add_write(v);
        }
    }

    impl TObject for Cell {
        fn lock(&self, item: &mut TransItem, txn: &Transaction) -> bool {
            txn.try_lock(item, &self.version)
        }

        fn check(&self, item: &TransItem, _txn: &Transaction) -> bool {
            self.version
                .check_version(item.read_version(), item.needs_unlock())
        }

        fn install(&self, item: &mut TransItem, txn: &Transaction) {
            let v = *item.write_value::<u64>().unwrap();
            self.value.store(v, Ordering::Relaxed);
            self.version
                .set_version_unlock(txn.install_version(self.version.value()));
            item.clear_needs_unlock();
        }

        fn unlock(&self, _item: &mut TransItem) {
            self.version.unlock();
        }
    }

    #[test]
    fn test_in_memory_is_a_default_engine_without_worker() {
        let stm = Stm::in_memory();
        assert_eq!(stm.config(), &StmConfig::default());
        assert!(!stm.is_maintenance_running());
        assert_eq!(stm.stats().active_transactions, 0);
        assert_eq!(stm.clocks().commit.current(), Clocks::new().commit.current());
    }

    #[test]
    fn test_maintenance_reports_stale_readers() {
        let config = StmConfig {
            stale_reader_warn_ms: 1,
            ..StmConfig::default()
        };
        let stm = Stm::new(config).unwrap();
        let txn = stm.begin();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(stm.run_maintenance().stale_readers, 1);
        drop(txn);
        assert_eq!(stm.run_maintenance().stale_readers, 0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = StmConfig {
            max_threads: 0,
            ..StmConfig::default()
        };
        assert!(matches!(Stm::new(config), Err(StmError::Config(_))));
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let stm = Stm::in_memory();
        let cell = Cell::new(1);
        stm.transaction(|txn| {
            let v = cell.read(txn)?;
            cell.write(txn, v + 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(cell.value.load(Ordering::Relaxed), 2);
        assert_eq!(stm.stats().transactions.committed, 1);
    }

    #[test]
    fn test_transaction_aborts_on_err() {
        let stm = Stm::in_memory();
        let cell = Cell::new(1);
        let result: StmResult<()> = stm.transaction(|txn| {
            cell.write(txn, 99);
            Err(StmError::aborted(AbortReason::User))
        });
        assert!(result.is_err());
        assert_eq!(cell.value.load(Ordering::Relaxed), 1);
        assert!(!cell.version.is_locked());
    }

    #[test]
    fn test_user_abort_is_not_retried() {
        let stm = Stm::in_memory();
        let calls = AtomicUsize::new(0);
        let result: StmResult<()> = stm.atomically(|_txn| {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(StmError::aborted(AbortReason::User))
        });
        assert!(matches!(result, Err(StmError::Aborted { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_retry_limit_exceeded() {
        let stm = Stm::in_memory();
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::new().with_max_retries(3).with_base_delay_ms(0);
        let result: StmResult<()> = stm.transaction_with_retry(&config, |_txn| {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(StmError::conflict("forced"))
        });
        match result {
            Err(StmError::RetryLimitExceeded {
                attempts,
                last_reason,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_reason, AbortReason::Conflict("forced"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_retry_succeeds_after_conflicts() {
        let stm = Stm::in_memory();
        let calls = AtomicUsize::new(0);
        let v = stm
            .transaction_with_retry(&RetryConfig::new().with_base_delay_ms(0), |_txn| {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(StmError::aborted(AbortReason::ValidationFailed))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_no_lost_update_with_atomically() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 200;

        let stm = Stm::in_memory();
        let cell = Cell::new(0);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (stm, cell, barrier) =
                    (Arc::clone(&stm), Arc::clone(&cell), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    let config = RetryConfig::new().with_max_retries(10_000).with_base_delay_ms(0);
                    for _ in 0..PER_THREAD {
                        stm.transaction_with_retry(&config, |txn| {
                            let v = cell.read(txn)?;
                            cell.write(txn, v + 1);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.value.load(Ordering::Relaxed), THREADS as u64 * PER_THREAD);
    }

    #[test]
    fn test_snapshot_guard_releases() {
        let stm = Stm::in_memory();
        let before = stm.snapshot_horizon();
        {
            let snap = stm.take_snapshot();
            assert_eq!(snap.sid(), before);
            assert_eq!(stm.snapshot_horizon(), snap.sid());
            assert_eq!(stm.stats().live_snapshots, 1);
            let txn = snap.begin();
            assert_eq!(txn.active_sid(), snap.sid());
        }
        assert_eq!(stm.stats().live_snapshots, 0);
        assert_eq!(stm.snapshot_horizon(), stm.clocks().snapshot.current());
    }

    #[test]
    fn test_manual_snapshot_ids() {
        let stm = Stm::in_memory();
        let a = stm.take_snapshot_id();
        let b = stm.take_snapshot_id();
        assert!(a < b);
        assert_eq!(stm.snapshot_horizon(), a);
        assert!(stm.release_snapshot(a));
        assert!(!stm.release_snapshot(a));
        assert_eq!(stm.snapshot_horizon(), b);
        assert!(stm.release_snapshot(b));
    }

    struct CountingCollectable {
        calls: AtomicUsize,
        last_horizon: AtomicU64,
    }

    impl SnapshotCollectable for CountingCollectable {
        fn collect_garbage(&self, horizon: Sid, _reclaimer: &Reclaimer) -> CollectStats {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.last_horizon.store(horizon, Ordering::Relaxed);
            CollectStats {
                compacted: 1,
                unlinked: 0,
            }
        }
    }

    #[test]
    fn test_maintenance_visits_collectables_and_prunes_dead() {
        let stm = Stm::in_memory();
        let live = Arc::new(CountingCollectable {
            calls: AtomicUsize::new(0),
            last_horizon: AtomicU64::new(0),
        });
        let as_dyn: Arc<dyn SnapshotCollectable> = live.clone();
        stm.register_collectable(&as_dyn);
        {
            let gone: Arc<dyn SnapshotCollectable> = Arc::new(CountingCollectable {
                calls: AtomicUsize::new(0),
                last_horizon: AtomicU64::new(0),
            });
            stm.register_collectable(&gone);
        }

        let snap = stm.take_snapshot();
        let stats = stm.run_maintenance();
        assert_eq!(stats.history.compacted, 1);
        assert_eq!(stats.expired_collectables, 1);
        assert_eq!(stats.snapshot_horizon, snap.sid());
        assert_eq!(live.last_horizon.load(Ordering::Relaxed), snap.sid());
        assert_eq!(stm.stats().collectables, 1);
    }

    #[test]
    fn test_maintenance_truncates_mvcc_chains() {
        let stm = Stm::in_memory();
        let obj = Arc::new(MvObject::new(Some(0u32)));
        let as_dyn: Arc<dyn MvCollectable> = obj.clone();
        stm.register_mv(&as_dyn);

        for v in 1..=5 {
            assert!(obj.nontrans_write(stm.clocks().commit.next(), Some(v)));
        }
        assert!(obj.chain_len() > 1);
        let stats = stm.run_maintenance();
        assert_eq!(stats.mvcc.visited, 1);
        assert_eq!(obj.chain_len(), 1);
        assert_eq!(obj.nontrans_read().unwrap().value(), Some(&5));
    }

    #[test]
    fn test_background_maintenance_runs_and_stops() {
        let config = StmConfig {
            background_maintenance: true,
            maintenance_interval_ms: 5,
            ..StmConfig::default()
        };
        let stm = Stm::new(config).unwrap();
        assert!(stm.is_maintenance_running());

        let counting = Arc::new(CountingCollectable {
            calls: AtomicUsize::new(0),
            last_horizon: AtomicU64::new(0),
        });
        let as_dyn: Arc<dyn SnapshotCollectable> = counting.clone();
        stm.register_collectable(&as_dyn);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counting.calls.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(counting.calls.load(Ordering::Relaxed) > 0);

        assert!(stm.stop_maintenance());
        assert!(!stm.is_maintenance_running());
        assert!(!stm.stop_maintenance());
    }
}
