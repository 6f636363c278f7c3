//! Multi-version history chains
//!
//! Every MVCC object keeps a chain of [`MvHistory`] nodes, newest first.
//! Readers pick the newest committed node whose write timestamp is not
//! after their read timestamp, so readers never block writers and old
//! readers keep seeing their version while newer commits pile up.
//!
//! ## Timestamps
//!
//! - `wtid`: commit timestamp of the transaction that wrote the node
//! - `rtid`: highest read timestamp any transaction has read the node at
//!
//! A writer with commit timestamp `t` may only append after a node whose
//! `rtid < t`: otherwise some reader at `>= t` already decided the node was
//! the latest version as of its read time, and appending would change that
//! reader's past.
//!
//! ## Commit hooks
//!
//! ```text
//! cp_lock     append a Pending node at the commit tid
//! cp_check    bump rtid of the read node, confirm it is still visible
//!             at the commit point
//! cp_install  promote Pending -> Committed / Deleted
//! cp_abort    mark Aborted and unlink from the head
//! ```

use crate::epoch::Reclaimer;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use strata_core::{Backoff, Tid};

// ============================================================================
// History node
// ============================================================================

/// Lifecycle of a history node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MvStatus {
    /// Appended by a committing transaction that has not finished
    Pending = 0,
    /// Committed value
    Committed = 1,
    /// Committed deletion
    Deleted = 2,
    /// Writer aborted; invisible to every reader
    Aborted = 3,
}

impl MvStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MvStatus::Pending,
            1 => MvStatus::Committed,
            2 => MvStatus::Deleted,
            _ => MvStatus::Aborted,
        }
    }

    /// Committed value or committed deletion
    pub fn is_committed(self) -> bool {
        matches!(self, MvStatus::Committed | MvStatus::Deleted)
    }
}

/// One version of an MVCC object
pub struct MvHistory<T> {
    wtid: Tid,
    rtid: AtomicU64,
    status: AtomicU8,
    value: Option<T>,
    prev: ArcSwapOption<MvHistory<T>>,
    next: Mutex<Weak<MvHistory<T>>>,
}

impl<T> MvHistory<T> {
    fn new(wtid: Tid, value: Option<T>, status: MvStatus) -> Self {
        Self {
            wtid,
            rtid: AtomicU64::new(wtid),
            status: AtomicU8::new(status as u8),
            value,
            prev: ArcSwapOption::empty(),
            next: Mutex::new(Weak::new()),
        }
    }

    /// Commit timestamp of the writer
    pub fn wtid(&self) -> Tid {
        self.wtid
    }

    /// Highest read timestamp this node was read at
    pub fn rtid(&self) -> Tid {
        self.rtid.load(Ordering::SeqCst)
    }

    /// Current status
    pub fn status(&self) -> MvStatus {
        MvStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Value; `None` for a deletion
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// True for a committed deletion
    pub fn is_deleted(&self) -> bool {
        self.status() == MvStatus::Deleted
    }

    /// Older neighbour
    pub fn prev(&self) -> Option<Arc<MvHistory<T>>> {
        self.prev.load_full()
    }

    /// Newer neighbour, if it is still alive
    pub fn next(&self) -> Option<Arc<MvHistory<T>>> {
        self.next.lock().upgrade()
    }

    fn set_status(&self, status: MvStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn bump_rtid(&self, tid: Tid) {
        self.rtid.fetch_max(tid, Ordering::SeqCst);
    }
}

impl<T> fmt::Debug for MvHistory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvHistory")
            .field("wtid", &self.wtid)
            .field("rtid", &self.rtid())
            .field("status", &self.status())
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

// ============================================================================
// Versioned object
// ============================================================================

type DeleteCallback = Box<dyn Fn() + Send + Sync>;

/// Head of a history chain
pub struct MvObject<T> {
    head: ArcSwap<MvHistory<T>>,
    on_delete: Mutex<Option<DeleteCallback>>,
    delete_fired: AtomicBool,
}

impl<T: Send + Sync + 'static> MvObject<T> {
    /// Object whose initial version (timestamp 0) holds `initial`
    pub fn new(initial: Option<T>) -> Self {
        let status = if initial.is_some() {
            MvStatus::Committed
        } else {
            MvStatus::Deleted
        };
        Self {
            head: ArcSwap::from_pointee(MvHistory::new(0, initial, status)),
            on_delete: Mutex::new(None),
            delete_fired: AtomicBool::new(false),
        }
    }

    /// Install the callback run once the object is collected as deleted
    pub fn set_delete_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_delete.lock() = Some(Box::new(f));
    }

    /// Newest node, whatever its status
    pub fn head(&self) -> Arc<MvHistory<T>> {
        self.head.load_full()
    }

    /// Newest committed node with `wtid <= tid`
    ///
    /// Pending nodes at or below `tid` belong to a writer that must be
    /// ordered before the caller; with `wait` the walk spins until they
    /// resolve, otherwise they are skipped.
    pub fn find(&self, tid: Tid, wait: bool) -> Option<Arc<MvHistory<T>>> {
        let mut cur = Some(self.head.load_full());
        while let Some(node) = cur {
            if node.wtid <= tid {
                let backoff = Backoff::new();
                loop {
                    match node.status() {
                        MvStatus::Committed | MvStatus::Deleted => return Some(node),
                        MvStatus::Pending if wait => backoff.snooze(),
                        _ => break,
                    }
                }
            }
            cur = node.prev();
        }
        None
    }

    /// Read at `tid` and register the read on the chosen node
    ///
    /// Repeats the lookup after bumping `rtid` so a writer that slipped in
    /// between the walk and the bump is either seen here or aborts on the
    /// bumped `rtid`.
    pub fn read_at(&self, tid: Tid) -> Option<Arc<MvHistory<T>>> {
        loop {
            let node = self.find(tid, true)?;
            node.bump_rtid(tid);
            match self.find(tid, true) {
                Some(again) if Arc::ptr_eq(&again, &node) => return Some(node),
                _ => continue,
            }
        }
    }

    /// Append a pending node at `tid`
    ///
    /// Fails if another writer is pending, a newer version is already
    /// committed, or a reader at `>= tid` has read the current head.
    pub fn cp_lock(&self, tid: Tid, value: Option<T>) -> Option<Arc<MvHistory<T>>> {
        let head = self.head.load_full();
        if !head.status().is_committed() || head.wtid >= tid || head.rtid() >= tid {
            return None;
        }
        let node = Arc::new(MvHistory::new(tid, value, MvStatus::Pending));
        node.prev.store(Some(Arc::clone(&head)));

        let swapped = self.head.compare_and_swap(&head, Arc::clone(&node));
        if !Arc::ptr_eq(&*swapped, &head) {
            return None;
        }
        // a reader may have bumped rtid after the first check
        if head.rtid() >= tid {
            self.cp_abort(&node);
            return None;
        }
        Some(node)
    }

    /// Validate that `read` is still the version visible at `at`
    ///
    /// Writers pass `commit_tid - 1` so their own pending node (sitting
    /// exactly at the commit tid) is not considered; read-only transactions
    /// pass their read timestamp.
    pub fn cp_check(&self, read: &Arc<MvHistory<T>>, at: Tid) -> bool {
        read.bump_rtid(at);
        match self.find(at, true) {
            Some(visible) => Arc::ptr_eq(&visible, read),
            None => false,
        }
    }

    /// Promote a pending node
    ///
    /// Installing a value re-arms the delete callback of a revived object.
    pub fn cp_install(&self, node: &Arc<MvHistory<T>>) {
        debug_assert_eq!(node.status(), MvStatus::Pending);
        if let Some(prev) = node.prev() {
            assert!(
                prev.wtid < node.wtid,
                "history chain out of order: {} after {}",
                node.wtid,
                prev.wtid
            );
            *prev.next.lock() = Arc::downgrade(node);
        }
        let status = if node.value.is_some() {
            MvStatus::Committed
        } else {
            MvStatus::Deleted
        };
        node.set_status(status);
        if status == MvStatus::Committed {
            self.delete_fired.store(false, Ordering::Release);
        }
    }

    /// Abort a pending node and unlink it from the head
    pub fn cp_abort(&self, node: &Arc<MvHistory<T>>) {
        node.set_status(MvStatus::Aborted);
        if let Some(prev) = node.prev() {
            let cur = self.head.compare_and_swap(node, prev);
            debug_assert!(Arc::ptr_eq(&*cur, node), "aborted node was not the head");
        }
    }

    /// Latest committed node, skipping pending writers
    pub fn nontrans_read(&self) -> Option<Arc<MvHistory<T>>> {
        self.find(Tid::MAX, false)
    }

    /// Install `value` as a committed version at `tid` outside any transaction
    ///
    /// Spins while a transactional writer is pending. Returns `false` if a
    /// version at or after `tid` already exists.
    pub fn nontrans_write(&self, tid: Tid, value: Option<T>) -> bool {
        let backoff = Backoff::new();
        let mut value = value;
        loop {
            let head = self.head.load_full();
            if head.status() == MvStatus::Pending || head.status() == MvStatus::Aborted {
                backoff.snooze();
                continue;
            }
            if head.wtid >= tid {
                return false;
            }
            let node = Arc::new(MvHistory::new(tid, value.take(), MvStatus::Pending));
            node.prev.store(Some(Arc::clone(&head)));
            let swapped = self.head.compare_and_swap(&head, Arc::clone(&node));
            if Arc::ptr_eq(&*swapped, &head) {
                self.cp_install(&node);
                return true;
            }
            // lost the race; recover the value and retry
            value = match Arc::try_unwrap(node) {
                Ok(n) => n.value,
                Err(_) => return false,
            };
        }
    }

    /// Truncate versions no reader at or after `horizon` can reach
    ///
    /// Keeps the node visible at `horizon` and everything newer; the cut-off
    /// tail is retired through `reclaimer`.
    pub fn collect(&self, horizon: Tid, reclaimer: &Reclaimer) -> MvCollectOutcome {
        let head = self.head.load_full();
        let visible = match self.find(horizon, false) {
            Some(v) => v,
            None => return MvCollectOutcome::default(),
        };

        let tail = visible.prev.swap(None);
        let truncated = chain_len(&tail);
        if let Some(tail) = tail {
            reclaimer.retire(Box::new(tail));
        }

        let mut outcome = MvCollectOutcome {
            truncated,
            deleted: false,
        };
        if Arc::ptr_eq(&head, &visible) && visible.is_deleted() {
            let guard = self.on_delete.lock();
            if !self.delete_fired.swap(true, Ordering::AcqRel) {
                if let Some(cb) = guard.as_ref() {
                    cb();
                }
                outcome.deleted = true;
            }
        }
        outcome
    }

    /// Number of nodes currently reachable from the head
    pub fn chain_len(&self) -> usize {
        chain_len(&Some(self.head.load_full()))
    }
}

fn chain_len<T>(start: &Option<Arc<MvHistory<T>>>) -> usize {
    let mut n = 0;
    let mut cur = start.clone();
    while let Some(node) = cur {
        n += 1;
        cur = node.prev();
    }
    n
}

impl<T> fmt::Debug for MvObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvObject")
            .field("head", &*self.head.load())
            .finish()
    }
}

/// Result of collecting one object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MvCollectOutcome {
    /// Nodes cut from the chain
    pub truncated: usize,
    /// Object was found deleted and its callback fired on this pass
    pub deleted: bool,
}
