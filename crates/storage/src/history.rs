//! Per-object version history
//!
//! Superseded wrappers are appended in `s_sid` order, so lookups are a binary
//! search. The deque lock is held only for the append, the search and the
//! compaction pop; readers never wait on payload data.

use crate::wrapper::NodeWrapper;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use strata_core::Sid;

/// Sorted deque of superseded versions
pub struct History<N> {
    list: RwLock<VecDeque<Arc<NodeWrapper<N>>>>,
}

impl<N> History<N> {
    /// Empty history
    pub fn new() -> Self {
        Self {
            list: RwLock::new(VecDeque::new()),
        }
    }

    /// Append `wrapper`, superseded at `time`
    ///
    /// # Panics
    ///
    /// Panics if `wrapper` does not sort after every entry already present.
    pub fn add_snapshot(&self, wrapper: Arc<NodeWrapper<N>>, time: Sid) {
        wrapper.supersede(time);
        let mut list = self.list.write();
        if let Some(last) = list.back() {
            assert!(
                last.s_sid() < wrapper.s_sid(),
                "history out of order: {} then {}",
                last.s_sid(),
                wrapper.s_sid()
            );
        }
        list.push_back(wrapper);
    }

    /// Youngest entry with `s_sid <= sid`, unless it was already superseded
    /// at or before `sid`
    pub fn search(&self, sid: Sid) -> Option<Arc<NodeWrapper<N>>> {
        let list = self.list.read();
        let idx = list.partition_point(|e| e.s_sid() <= sid);
        if idx == 0 {
            return None;
        }
        let found = &list[idx - 1];
        if found.c_sid() <= sid {
            return None;
        }
        Some(Arc::clone(found))
    }

    /// Drop leading entries whose window closed at or before `horizon`
    ///
    /// Returns the removed wrappers so the caller can defer their release.
    pub fn cleanup_until(&self, horizon: Sid) -> Vec<Arc<NodeWrapper<N>>> {
        let mut list = self.list.write();
        let mut removed = Vec::new();
        while let Some(front) = list.front() {
            if front.c_sid() > horizon {
                break;
            }
            if let Some(w) = list.pop_front() {
                removed.push(w);
            }
        }
        removed
    }

    /// True if no superseded version is retained
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Number of retained versions
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// `(s_sid, c_sid)` of every retained entry, oldest first
    pub fn windows(&self) -> Vec<(Sid, Sid)> {
        self.list
            .read()
            .iter()
            .map(|w| (w.s_sid(), w.c_sid()))
            .collect()
    }
}

impl<N> Default for History<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> std::fmt::Debug for History<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("windows", &self.windows())
            .finish()
    }
}
