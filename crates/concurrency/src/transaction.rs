//! Transaction context
//!
//! A [`Transaction`] owns the item set built up while the transaction body
//! runs, plus the timestamps the commit protocol needs:
//!
//! - `read_tid`: commit clock value at begin; MVCC reads resolve against it
//! - `commit_tid`: allocated on first request during commit and shared by
//!   every write the transaction installs
//! - `active_sid`: snapshot the transaction reads from (`0` = live)
//!
//! Dropping a transaction that never reached commit aborts it, so staged
//! structural changes (poisoned list nodes, pending history entries) are
//! always cleaned up.

use crate::epoch::EpochTicket;
use crate::item::{owner_ident, ItemKey, TransItem};
use crate::manager::{CommitError, TransactionManager};
use crate::participant::TObject;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{
    tid, AbortReason, Backoff, Clocks, Sid, StmError, StmResult, TVersion, ThreadId, Tid,
    INVALID_SNAPSHOT,
};
use tracing::debug;

/// Identity of an item within a transaction: (owner address, key identity)
pub(crate) type ItemIdent = (usize, (u8, usize));

/// Status of a transaction
///
/// State transitions:
/// - `Executing` → `Locking` → `Validating` → `Installing` → `Committed`
/// - `Executing` | `Locking` | `Validating` → `Aborted`
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `Aborted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Body is running; items may be added
    Executing,
    /// Acquiring write-set locks
    Locking,
    /// Re-validating read observations
    Validating,
    /// Publishing writes
    Installing,
    /// Transaction committed successfully
    Committed,
    /// Transaction was aborted
    Aborted {
        /// Cause of the abort
        reason: AbortReason,
    },
}

/// Per-transaction context passed explicitly through every transactional
/// operation
pub struct Transaction {
    txn_id: u64,
    thread_id: ThreadId,
    read_tid: Tid,
    commit_tid: AtomicU64,
    stamp_sid: Sid,
    active_sid: Sid,
    needs_sid_stamp: bool,
    commit_writes: bool,
    status: TransactionStatus,
    items: Vec<TransItem>,
    index: FxHashMap<ItemIdent, usize>,
    manager: Arc<TransactionManager>,
    _ticket: EpochTicket,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn new(
        manager: Arc<TransactionManager>,
        txn_id: u64,
        thread_id: ThreadId,
        read_tid: Tid,
        ticket: EpochTicket,
    ) -> Self {
        Self {
            txn_id,
            thread_id,
            read_tid,
            commit_tid: AtomicU64::new(0),
            stamp_sid: INVALID_SNAPSHOT,
            active_sid: INVALID_SNAPSHOT,
            needs_sid_stamp: false,
            commit_writes: false,
            status: TransactionStatus::Executing,
            items: Vec::new(),
            index: FxHashMap::default(),
            manager,
            _ticket: ticket,
            start_time: Instant::now(),
        }
    }

    // === Identity & timestamps ===

    /// Unique transaction id
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// Worker id stamped into version words this transaction locks
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Commit clock value observed at begin
    pub fn read_tid(&self) -> Tid {
        self.read_tid
    }

    /// Commit timestamp, allocated on first call
    ///
    /// Every write installed by this transaction carries the same value.
    pub fn commit_tid(&self) -> Tid {
        let cur = self.commit_tid.load(Ordering::Relaxed);
        if cur != 0 {
            return cur;
        }
        let allocated = self.manager.clocks().commit.next();
        self.commit_tid.store(allocated, Ordering::Relaxed);
        allocated
    }

    /// Commit timestamp if one has been allocated
    pub fn commit_tid_if_allocated(&self) -> Option<Tid> {
        match self.commit_tid.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    /// Version word to publish over `current`
    ///
    /// The commit timestamp, bumped past `current` if a later commit already
    /// wrote the cell, so versions never go backwards.
    pub fn install_version(&self, current: Tid) -> Tid {
        self.commit_tid().max(tid::next_version(tid::counter(current)))
    }

    /// Snapshot id new versions installed by this commit carry
    ///
    /// Only valid during install of a transaction that requested stamping
    /// through [`require_sid_stamp`](Self::require_sid_stamp).
    pub fn stamp_sid(&self) -> Sid {
        debug_assert!(self.stamp_sid != INVALID_SNAPSHOT, "stamp_sid outside install");
        self.stamp_sid
    }

    /// Ask the commit protocol to hold the snapshot gate across install
    ///
    /// Participants whose writes must be ordered against snapshot takes call
    /// this when they stage a write.
    pub fn require_sid_stamp(&mut self) {
        self.needs_sid_stamp = true;
    }

    pub(crate) fn needs_sid_stamp(&self) -> bool {
        self.needs_sid_stamp
    }

    /// True while committing a transaction that has at least one write
    ///
    /// Lets participants pick the validation point during `check`: the
    /// commit tid for writers, the current commit clock for read-only
    /// transactions.
    pub fn has_commit_writes(&self) -> bool {
        self.commit_writes
    }

    pub(crate) fn set_commit_writes(&mut self, writes: bool) {
        self.commit_writes = writes;
    }

    pub(crate) fn set_stamp_sid(&mut self, sid: Sid) {
        self.stamp_sid = sid;
    }

    // === Snapshot scoping ===

    /// Snapshot this transaction reads from; `0` means live reads
    pub fn active_sid(&self) -> Sid {
        self.active_sid
    }

    /// Scope subsequent reads to snapshot `sid`
    pub fn set_active_sid(&mut self, sid: Sid) {
        self.active_sid = sid;
    }

    /// Clock pair shared with every object of this engine
    pub fn clocks(&self) -> &Arc<Clocks> {
        self.manager.clocks()
    }

    /// Manager that began this transaction
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    // === Item set ===

    /// Item for `(owner, key)`, created on first access
    pub fn item(&mut self, owner: &Arc<dyn TObject>, key: ItemKey) -> &mut TransItem {
        let ident = (owner_ident(owner), key.ident());
        let idx = match self.index.get(&ident) {
            Some(&idx) => idx,
            None => {
                let idx = self.items.len();
                self.items.push(TransItem::new(Arc::clone(owner), key));
                self.index.insert(ident, idx);
                idx
            }
        };
        &mut self.items[idx]
    }

    /// Existing item for `(owner, key)`, without creating one
    pub fn check_item(&self, owner: &Arc<dyn TObject>, key: &ItemKey) -> Option<&TransItem> {
        let ident = (owner_ident(owner), key.ident());
        self.index.get(&ident).map(|&idx| &self.items[idx])
    }

    /// Mutable variant of [`check_item`](Self::check_item)
    pub fn check_item_mut(
        &mut self,
        owner: &Arc<dyn TObject>,
        key: &ItemKey,
    ) -> Option<&mut TransItem> {
        let ident = (owner_ident(owner), key.ident());
        match self.index.get(&ident) {
            Some(&idx) => Some(&mut self.items[idx]),
            None => None,
        }
    }

    /// All items in insertion order
    pub fn items(&self) -> &[TransItem] {
        &self.items
    }

    /// Number of items
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Number of items with a write
    pub fn write_count(&self) -> usize {
        self.items.iter().filter(|i| i.has_write()).count()
    }

    /// True if no item has a write
    pub fn is_read_only(&self) -> bool {
        !self.items.iter().any(|i| i.has_write())
    }

    pub(crate) fn take_items(&mut self) -> Vec<TransItem> {
        self.index.clear();
        std::mem::take(&mut self.items)
    }

    // === Locking helper ===

    /// Lock `version` for `item`, spinning a bounded number of times
    ///
    /// On success the item is marked as holding a lock. Gives up (returning
    /// `false`) once backoff is exhausted so a contended lock turns into an
    /// abort rather than an unbounded wait.
    pub fn try_lock(&self, item: &mut TransItem, version: &TVersion) -> bool {
        if item.needs_unlock() {
            return true;
        }
        let backoff = Backoff::new();
        loop {
            if version.try_lock(self.thread_id) {
                item.set_needs_unlock();
                return true;
            }
            if backoff.is_completed() {
                return false;
            }
            backoff.snooze();
        }
    }

    // === State management ===

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// Check if transaction is still running its body
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Executing)
    }

    /// Check if transaction is committed
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TransactionStatus::Committed)
    }

    /// Check if transaction is aborted
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, TransactionStatus::Aborted { .. })
    }

    /// Abort reason, if aborted
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.status {
            TransactionStatus::Aborted { reason } => Some(reason),
            _ => None,
        }
    }

    /// Check if transaction can accept operations
    ///
    /// # Errors
    /// Returns `StmError::InvalidState` if the body has already finished.
    pub fn ensure_active(&self) -> StmResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StmError::InvalidState {
                state: format!("transaction {} is {:?}", self.txn_id, self.status),
            })
        }
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    /// Abort the transaction
    ///
    /// Runs `cleanup(false)` on every item, discards the item set and returns
    /// the error to hand back to the retry loop. Calling this on a finished
    /// transaction only builds the error.
    pub fn abort(&mut self, reason: AbortReason) -> StmError {
        if self.is_active() {
            debug!(txn_id = self.txn_id, %reason, items = self.items.len(), "transaction aborted");
            let mut items = self.take_items();
            for item in items.iter_mut() {
                let owner = Arc::clone(item.owner());
                owner.cleanup(item, false);
            }
            self.status = TransactionStatus::Aborted {
                reason: reason.clone(),
            };
        }
        StmError::aborted(reason)
    }

    /// Run the commit protocol
    ///
    /// Returns the commit timestamp (or the read timestamp for a read-only
    /// transaction).
    pub fn commit(&mut self) -> StmResult<Tid> {
        let manager = Arc::clone(&self.manager);
        manager.commit(self).map_err(CommitError::into_stm)
    }

    /// Time since begin
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.abort(AbortReason::User);
        }
        self.manager.finish(self.txn_id);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("thread_id", &self.thread_id)
            .field("read_tid", &self.read_tid)
            .field("commit_tid", &self.commit_tid_if_allocated())
            .field("active_sid", &self.active_sid)
            .field("status", &self.status)
            .field("items", &self.items.len())
            .finish()
    }
}
