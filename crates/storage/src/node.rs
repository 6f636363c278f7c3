//! Snapshot-aware object base
//!
//! A [`NodeBase`] is the stable identity of one object. Its current version
//! lives in `root`; versions still visible to some snapshot are kept in
//! `history`. The object's [`TVersion`] guards every change to `root`.
//!
//! ## Copy-on-write
//!
//! Installing over a root that an issued snapshot may already have observed
//! (`s_sid < GSC`) first moves that root into history, stamped with the sid
//! at which it stops being current, and only then swaps in the new root. A
//! reader that sees the new root and falls back to history therefore always
//! finds the entry it needs.

use crate::history::History;
use crate::object_id::ObjectId;
use crate::wrapper::NodeWrapper;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_core::{tid, Sid, TVersion, INVALID_SNAPSHOT};

/// Stable identity of a snapshot-aware object
pub struct NodeBase<N> {
    root: ArcSwap<NodeWrapper<N>>,
    unlinked: AtomicBool,
    version: TVersion,
    history: History<N>,
}

impl<N> NodeBase<N> {
    /// Object whose first version is not yet published
    ///
    /// The version cell starts poisoned; the inserting commit clears it.
    pub fn pending(node: N) -> Self {
        Self {
            root: ArcSwap::from_pointee(NodeWrapper::pending(node)),
            unlinked: AtomicBool::new(false),
            version: TVersion::new_invalid(tid::INCREMENT_VALUE),
            history: History::new(),
        }
    }

    /// Object published at `sid`
    pub fn committed(node: N, sid: Sid) -> Self {
        Self {
            root: ArcSwap::from_pointee(NodeWrapper::committed(node, sid)),
            unlinked: AtomicBool::new(false),
            version: TVersion::new(tid::INCREMENT_VALUE),
            history: History::new(),
        }
    }

    /// Indirect handle to this object
    pub fn object_id(self: &Arc<Self>) -> ObjectId<N> {
        ObjectId::Indirect(Arc::clone(self))
    }

    /// Current version
    pub fn root(&self) -> Arc<NodeWrapper<N>> {
        self.root.load_full()
    }

    /// Lock + version word guarding `root`
    pub fn version(&self) -> &TVersion {
        &self.version
    }

    /// True once the object has been removed from its container
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// Mark the object as removed from its container
    pub fn set_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }

    /// Clear the unlinked mark
    pub fn clear_unlinked(&self) {
        self.unlinked.store(false, Ordering::Release);
    }

    /// True if the current root may already be observed by an issued
    /// snapshot, given the global snapshot counter `gsc`
    pub fn is_immutable(&self, gsc: Sid) -> bool {
        let s = self.root.load().s_sid();
        s != INVALID_SNAPSHOT && s < gsc
    }

    /// Version visible at `sid`
    ///
    /// `sid == 0` is a live read: the current root, unless the object has
    /// been unlinked. Otherwise the root answers when it was published at or
    /// before `sid`, and history answers when it was published later. An
    /// object never published returns `None` for every snapshot.
    pub fn deref(&self, sid: Sid) -> Option<Arc<NodeWrapper<N>>> {
        let root = self.root();
        if sid == INVALID_SNAPSHOT {
            if self.is_unlinked() {
                return None;
            }
            return Some(root);
        }
        if !root.is_committed() {
            return None;
        }
        if root.s_sid() <= sid {
            return Some(root);
        }
        self.history.search(sid)
    }

    /// Move the current root into history, superseded at `time`
    ///
    /// Only valid while holding the version lock during install.
    pub fn save_copy_in_history(&self, time: Sid) {
        assert!(self.is_immutable(time), "copy-on-write of a mutable root");
        self.history.add_snapshot(self.root(), time);
    }

    /// Publish a new root at `sid`
    ///
    /// Performs the copy-on-write step first when the current root is
    /// immutable. Only valid while holding the version lock.
    pub fn install(&self, node: N, sid: Sid) {
        self.publish(NodeWrapper::committed(node, sid), sid);
    }

    /// Publish a deletion marker at `sid`
    pub fn install_tombstone(&self, node: N, sid: Sid) {
        self.publish(NodeWrapper::tombstone(node, sid), sid);
    }

    fn publish(&self, wrapper: NodeWrapper<N>, sid: Sid) {
        debug_assert!(sid != INVALID_SNAPSHOT, "publish without a snapshot id");
        if self.is_immutable(sid) {
            self.save_copy_in_history(sid);
        }
        self.root.store(Arc::new(wrapper));
    }

    /// Superseded version visible at `sid`, if retained
    pub fn search_history(&self, sid: Sid) -> Option<Arc<NodeWrapper<N>>> {
        self.history.search(sid)
    }

    /// Drop history no snapshot at or above `horizon` can reach
    pub fn cleanup_until(&self, horizon: Sid) -> Vec<Arc<NodeWrapper<N>>> {
        self.history.cleanup_until(horizon)
    }

    /// True if no superseded version is retained
    pub fn history_is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Number of retained superseded versions
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// `(s_sid, c_sid)` of every retained version, oldest first
    pub fn history_windows(&self) -> Vec<(Sid, Sid)> {
        self.history.windows()
    }
}

impl<N: fmt::Debug> fmt::Debug for NodeBase<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBase")
            .field("root", &self.root())
            .field("unlinked", &self.is_unlinked())
            .field("version", &self.version)
            .field("history", &self.history)
            .finish()
    }
}
