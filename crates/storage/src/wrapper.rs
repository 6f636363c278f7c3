//! Node wrappers
//!
//! A [`NodeWrapper`] is one immutable version of an object's payload. It
//! carries the snapshot id at which it became current (`s_sid`) and, once a
//! newer version replaces it, the snapshot id at which it stopped being
//! current (`c_sid`). Its visibility window is therefore `[s_sid, c_sid)`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{Sid, INVALID_SNAPSHOT};

/// One version of an object's payload
pub struct NodeWrapper<N> {
    node: N,
    s_sid: Sid,
    c_sid: AtomicU64,
    deleted: bool,
}

impl<N> NodeWrapper<N> {
    /// Wrapper for a payload no commit has published yet
    pub fn pending(node: N) -> Self {
        Self::with_sid(node, INVALID_SNAPSHOT, false)
    }

    /// Wrapper published at `s_sid`
    pub fn committed(node: N, s_sid: Sid) -> Self {
        Self::with_sid(node, s_sid, false)
    }

    /// Deletion marker published at `s_sid`
    ///
    /// The payload is kept so the wrapper can still be cloned forward if the
    /// object is revived.
    pub fn tombstone(node: N, s_sid: Sid) -> Self {
        Self::with_sid(node, s_sid, true)
    }

    pub(crate) fn with_sid(node: N, s_sid: Sid, deleted: bool) -> Self {
        Self {
            node,
            s_sid,
            c_sid: AtomicU64::new(INVALID_SNAPSHOT),
            deleted,
        }
    }

    /// Payload
    pub fn node(&self) -> &N {
        &self.node
    }

    /// Snapshot id at which this version became current
    pub fn s_sid(&self) -> Sid {
        self.s_sid
    }

    /// Snapshot id at which this version was superseded, `0` while current
    pub fn c_sid(&self) -> Sid {
        self.c_sid.load(Ordering::Acquire)
    }

    /// True if this version marks the object as deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// True once a commit has published this version
    pub fn is_committed(&self) -> bool {
        self.s_sid != INVALID_SNAPSHOT
    }

    /// True once a newer version replaced this one
    pub fn is_superseded(&self) -> bool {
        self.c_sid() != INVALID_SNAPSHOT
    }

    /// True if a read at `sid` resolves to this version
    pub fn visible_at(&self, sid: Sid) -> bool {
        if !self.is_committed() || self.s_sid > sid {
            return false;
        }
        let c = self.c_sid();
        c == INVALID_SNAPSHOT || sid < c
    }

    /// Close the visibility window at `sid`
    pub(crate) fn supersede(&self, sid: Sid) {
        let prev = self.c_sid.swap(sid, Ordering::AcqRel);
        assert_eq!(prev, INVALID_SNAPSHOT, "wrapper superseded twice");
        assert!(
            sid > self.s_sid,
            "superseding sid {} does not follow s_sid {}",
            sid,
            self.s_sid
        );
    }
}

impl<N: Clone> NodeWrapper<N> {
    /// Copy of the payload
    pub fn cloned(&self) -> N {
        self.node.clone()
    }
}

impl<N: fmt::Debug> fmt::Debug for NodeWrapper<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeWrapper")
            .field("node", &self.node)
            .field("s_sid", &self.s_sid)
            .field("c_sid", &self.c_sid())
            .field("deleted", &self.deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_wrapper_is_never_visible() {
        let w = NodeWrapper::pending(7u32);
        assert!(!w.is_committed());
        assert!(!w.visible_at(1));
        assert!(!w.visible_at(u64::MAX));
    }

    #[test]
    fn test_visibility_window() {
        let w = NodeWrapper::committed("a", 3);
        assert!(!w.visible_at(2));
        assert!(w.visible_at(3));
        assert!(w.visible_at(100));

        w.supersede(6);
        assert!(w.is_superseded());
        assert!(w.visible_at(5));
        assert!(!w.visible_at(6));
    }

    #[test]
    #[should_panic(expected = "superseded twice")]
    fn test_double_supersede_panics() {
        let w = NodeWrapper::committed(1u8, 2);
        w.supersede(3);
        w.supersede(4);
    }

    #[test]
    fn test_tombstone_keeps_payload() {
        let w = NodeWrapper::tombstone(String::from("gone"), 4);
        assert!(w.is_deleted());
        assert_eq!(w.cloned(), "gone");
    }
}
