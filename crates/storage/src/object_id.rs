//! Object handles
//!
//! An [`ObjectId`] names an object for snapshot reads. The indirect form goes
//! through the object's [`NodeBase`] on every lookup. Once a lookup resolves
//! to a superseded version, that version can never change again, so the
//! handle may be rewritten into the direct form pointing straight at it.
//! Later lookups inside the same window skip the root load and the history
//! search; lookups outside it fall back to the base.

use crate::node::NodeBase;
use crate::wrapper::NodeWrapper;
use std::sync::Arc;
use strata_core::{Sid, INVALID_SNAPSHOT};

/// Handle to a snapshot-aware object
pub enum ObjectId<N> {
    /// Resolve through the object's base
    Indirect(Arc<NodeBase<N>>),
    /// Cached superseded version, with its base for misses
    Direct {
        /// Object the version belongs to
        base: Arc<NodeBase<N>>,
        /// Superseded version
        wrapper: Arc<NodeWrapper<N>>,
    },
}

impl<N> ObjectId<N> {
    /// True for the direct form
    pub fn is_direct(&self) -> bool {
        matches!(self, ObjectId::Direct { .. })
    }

    /// Object this handle names
    pub fn base(&self) -> &Arc<NodeBase<N>> {
        match self {
            ObjectId::Indirect(base) => base,
            ObjectId::Direct { base, .. } => base,
        }
    }

    /// Cached version of the direct form
    pub fn direct_wrapper(&self) -> Option<&Arc<NodeWrapper<N>>> {
        match self {
            ObjectId::Indirect(_) => None,
            ObjectId::Direct { wrapper, .. } => Some(wrapper),
        }
    }

    /// Version visible at `sid`
    ///
    /// See [`NodeBase::deref`] for the resolution rules.
    pub fn deref(&self, sid: Sid) -> Option<Arc<NodeWrapper<N>>> {
        match self {
            ObjectId::Direct { wrapper, .. }
                if sid != INVALID_SNAPSHOT && wrapper.visible_at(sid) =>
            {
                Some(Arc::clone(wrapper))
            }
            _ => self.base().deref(sid),
        }
    }

    /// Point this handle straight at `wrapper`
    ///
    /// # Panics
    ///
    /// Panics if `wrapper` is still the current version.
    pub fn set_direct_link(&mut self, wrapper: Arc<NodeWrapper<N>>) {
        assert!(wrapper.is_superseded(), "direct link to a mutable version");
        let base = Arc::clone(self.base());
        *self = ObjectId::Direct { base, wrapper };
    }

    /// [`deref`](Self::deref), caching a superseded hit as a direct link
    pub fn resolve(&mut self, sid: Sid) -> Option<Arc<NodeWrapper<N>>> {
        let found = self.deref(sid)?;
        let cached = match self {
            ObjectId::Direct { wrapper, .. } => Arc::ptr_eq(wrapper, &found),
            ObjectId::Indirect(_) => false,
        };
        if !cached && found.is_superseded() {
            self.set_direct_link(Arc::clone(&found));
        }
        Some(found)
    }
}

impl<N> Clone for ObjectId<N> {
    fn clone(&self) -> Self {
        match self {
            ObjectId::Indirect(base) => ObjectId::Indirect(Arc::clone(base)),
            ObjectId::Direct { base, wrapper } => ObjectId::Direct {
                base: Arc::clone(base),
                wrapper: Arc::clone(wrapper),
            },
        }
    }
}

impl<N> std::fmt::Debug for ObjectId<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectId::Indirect(base) => write!(f, "ObjectId::Indirect({:p})", Arc::as_ptr(base)),
            ObjectId::Direct { wrapper, .. } => write!(
                f,
                "ObjectId::Direct(s_sid={}, c_sid={})",
                wrapper.s_sid(),
                wrapper.c_sid()
            ),
        }
    }
}
