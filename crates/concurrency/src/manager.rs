//! Transaction manager and commit protocol
//!
//! Provides atomic commit by orchestrating every participant touched by a
//! transaction:
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. lock     - lock every written item in canonical (owner, key) order
//! 2. check    - re-validate every read observation
//! 3. install  - allocate the commit tid, enter the snapshot gate if the
//!               transaction stamps sids, publish every write
//! 4. unlock   - release locks install did not release, leave the gate
//! 5. cleanup  - cleanup(committed) on every item
//! ```
//!
//! Any failure in steps 1-2 releases acquired locks in reverse order and
//! runs `cleanup(false)`; nothing has been published, so an aborted
//! transaction leaves no visible effects.
//!
//! The manager also tracks in-flight transactions so background
//! maintenance can compute the oldest read timestamp still in use.

use crate::epoch::Reclaimer;
use crate::item::TransItem;
use crate::transaction::{Transaction, TransactionStatus};
use dashmap::DashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{AbortReason, Clocks, StmError, ThreadId, Tid};
use tracing::{debug, trace};

/// Error type for commit failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// A lock or validation step failed; nothing was published
    Aborted(AbortReason),

    /// Transaction was not in correct state for commit
    InvalidState(String),
}

impl CommitError {
    /// Convert into the engine-wide error type
    pub fn into_stm(self) -> StmError {
        match self {
            CommitError::Aborted(reason) => StmError::aborted(reason),
            CommitError::InvalidState(state) => StmError::InvalidState { state },
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::Aborted(reason) => write!(f, "Commit aborted: {}", reason),
            CommitError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<CommitError> for StmError {
    fn from(e: CommitError) -> Self {
        e.into_stm()
    }
}

/// Commit/abort counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Transactions begun
    pub begun: u64,
    /// Transactions committed with at least one write
    pub committed: u64,
    /// Read-only transactions committed
    pub read_only: u64,
    /// Transactions aborted at commit time
    pub aborted: u64,
}

/// Manages transaction lifecycle and atomic commits
pub struct TransactionManager {
    clocks: Arc<Clocks>,
    reclaimer: Arc<Reclaimer>,

    /// Next transaction ID
    next_txn_id: AtomicU64,

    /// In-flight transactions: txn_id -> read_tid
    active: DashMap<u64, Tid>,

    begun: AtomicU64,
    committed: AtomicU64,
    read_only: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    /// Create a manager over the given clocks and reclaimer
    pub fn new(clocks: Arc<Clocks>, reclaimer: Arc<Reclaimer>) -> Self {
        Self {
            clocks,
            reclaimer,
            next_txn_id: AtomicU64::new(1),
            active: DashMap::new(),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            read_only: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Clock pair
    pub fn clocks(&self) -> &Arc<Clocks> {
        &self.clocks
    }

    /// Deferred reclamation queue
    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Begin a transaction on behalf of worker `thread_id`
    pub fn begin(self: &Arc<Self>, thread_id: ThreadId) -> Transaction {
        let txn_id = self.next_txn_id();
        let ticket = self.reclaimer.pin();
        // register before reading the clock so gc_horizon never passes us
        self.active.insert(txn_id, 0);
        let read_tid = self.clocks.commit.current();
        self.active.insert(txn_id, read_tid);
        self.begun.fetch_add(1, Ordering::Relaxed);
        trace!(txn_id, read_tid, thread = %thread_id, "transaction begun");
        Transaction::new(Arc::clone(self), txn_id, thread_id, read_tid, ticket)
    }

    /// Forget a finished transaction
    pub(crate) fn finish(&self, txn_id: u64) {
        self.active.remove(&txn_id);
    }

    /// Number of in-flight transactions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Oldest read timestamp any in-flight transaction may still resolve
    ///
    /// Falls back to the current commit clock when nothing is in flight.
    pub fn gc_horizon(&self) -> Tid {
        let now = self.clocks.commit.current();
        self.active
            .iter()
            .map(|e| *e.value())
            .min()
            .map_or(now, |min| min.min(now))
    }

    /// Counters since creation
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            read_only: self.read_only.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    /// Commit a transaction atomically
    ///
    /// # Returns
    /// - Ok(commit_tid) on success; a read-only transaction returns its
    ///   read timestamp
    /// - Err(CommitError) if a lock or validation step fails
    pub fn commit(&self, txn: &mut Transaction) -> Result<Tid, CommitError> {
        if !txn.is_active() {
            return Err(CommitError::InvalidState(format!(
                "cannot commit transaction {} from state {:?}",
                txn.txn_id(),
                txn.status()
            )));
        }

        let mut items = txn.take_items();
        let mut write_order: SmallVec<[usize; 16]> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.has_write())
            .map(|(idx, _)| idx)
            .collect();
        write_order.sort_by_key(|&idx| items[idx].lock_order());
        txn.set_commit_writes(!write_order.is_empty());

        // Phase 1: lock
        txn.set_status(TransactionStatus::Locking);
        for &idx in &write_order {
            let owner = Arc::clone(items[idx].owner());
            if !owner.lock(&mut items[idx], txn) {
                return Err(self.fail(txn, &mut items, &write_order, AbortReason::LockFailed));
            }
        }

        // Phase 2: check
        txn.set_status(TransactionStatus::Validating);
        let stale = items
            .iter()
            .any(|item| item.has_read() && !item.owner().check(item, txn));
        if stale {
            return Err(self.fail(
                txn,
                &mut items,
                &write_order,
                AbortReason::ValidationFailed,
            ));
        }

        if write_order.is_empty() {
            txn.set_status(TransactionStatus::Committed);
            Self::cleanup_all(&mut items, true);
            self.read_only.fetch_add(1, Ordering::Relaxed);
            trace!(txn_id = txn.txn_id(), reads = items.len(), "read-only commit");
            return Ok(txn.read_tid());
        }

        // Phase 3: install
        txn.set_status(TransactionStatus::Installing);
        let commit_tid = txn.commit_tid();
        let gated = txn.needs_sid_stamp();
        if gated {
            let sid = self.clocks.snapshot.lock_read_next_sid();
            txn.set_stamp_sid(sid);
        }
        for &idx in &write_order {
            let owner = Arc::clone(items[idx].owner());
            owner.install(&mut items[idx], txn);
        }

        // Phase 4: unlock
        Self::unlock_all(&mut items, &write_order);
        if gated {
            self.clocks.snapshot.unlock_read_next_sid();
        }
        txn.set_status(TransactionStatus::Committed);

        // Phase 5: cleanup
        Self::cleanup_all(&mut items, true);

        self.committed.fetch_add(1, Ordering::Relaxed);
        trace!(
            txn_id = txn.txn_id(),
            commit_tid,
            writes = write_order.len(),
            "transaction committed"
        );
        Ok(commit_tid)
    }

    fn fail(
        &self,
        txn: &mut Transaction,
        items: &mut [TransItem],
        write_order: &[usize],
        reason: AbortReason,
    ) -> CommitError {
        Self::unlock_all(items, write_order);
        Self::cleanup_all(items, false);
        txn.set_status(TransactionStatus::Aborted {
            reason: reason.clone(),
        });
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id = txn.txn_id(), %reason, items = items.len(), "commit aborted");
        CommitError::Aborted(reason)
    }

    fn unlock_all(items: &mut [TransItem], write_order: &[usize]) {
        for &idx in write_order.iter().rev() {
            let item = &mut items[idx];
            if item.needs_unlock() {
                let owner = Arc::clone(item.owner());
                owner.unlock(item);
                item.clear_needs_unlock();
            }
        }
    }

    fn cleanup_all(items: &mut [TransItem], committed: bool) {
        for item in items.iter_mut() {
            let owner = Arc::clone(item.owner());
            owner.cleanup(item, committed);
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txn_id", &self.next_txn_id.load(Ordering::Relaxed))
            .field("active", &self.active.len())
            .field("stats", &self.stats())
            .finish()
    }
}
