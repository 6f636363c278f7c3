//! TSortedList: snapshot-aware transactional sorted list
//!
//! ## Design
//!
//! A singly linked list kept sorted by key. Every node owns a [`NodeBase`]
//! holding its current value, its version cell and the history snapshot
//! readers need. Two kinds of transaction item are used:
//!
//! - the list item (`LIST_KEY`) carries the list-wide version. Absent-key
//!   lookups, scans and size reads observe it; any change to the logical key
//!   set (insert of a new key, erase of an existing one) writes it, with the
//!   pending size delta as payload.
//! - node items carry a node's version. Reads of a present key observe it;
//!   updates and erases write it.
//!
//! ## Inserts
//!
//! A new key is spliced in immediately as a poisoned node (pending root,
//! invalid version) so concurrent inserters of the same key conflict instead
//! of creating duplicates. A deleted node still in the list is reused by
//! poisoning it. Commit clears the poison; abort unlinks the new node or
//! unpoisons the reused one.
//!
//! ## Erases
//!
//! Committed erases publish a tombstone. The node stays linked until no
//! snapshot can resolve to an older version of it, at which point commit
//! cleanup or [`collect_garbage`](TSortedList::collect_garbage) unlinks it and
//! hands it to the reclaimer.
//!
//! ## Links
//!
//! Every edge (the head and each node's `next`) is a [`Link`] holding the
//! target node together with its [`ObjectId`]. Snapshot reads resolve the
//! target through the link and, once it resolves to a superseded version,
//! swap in a link whose handle is direct so later reads at that snapshot
//! skip the history search. Structural changes replace links under the
//! structure mutex, which makes any racing swap fail. Garbage collection
//! turns direct links back into indirect ones once no live snapshot can use
//! the cached version.
//!
//! ## Lock order
//!
//! list version → structure mutex → node versions → snapshot gate.
//! Transaction bodies take the structure mutex alone; commits take list and
//! node versions (in item order) and then the gate.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_concurrency::{flags, Garbage, ItemKey, Reclaimer, TObject, TransItem, Transaction};
use strata_core::{
    tid, AbortReason, Backoff, Clocks, Sid, StmResult, TVersion, ThreadId, Tid,
    INVALID_SNAPSHOT,
};
use strata_engine::{CollectStats, SnapshotCollectable, Stm};
use strata_storage::{NodeBase, NodeWrapper, ObjectId};
use tracing::trace;

use crate::ensure_writable;

/// Item key of the list-wide version
const LIST_KEY: ItemKey = ItemKey::Const(0);

/// Node item: inserted by this transaction
const INSERT_BIT: u32 = flags::USER0_BIT;
/// Node item: erased by this transaction
const DELETE_BIT: u32 = flags::USER0_BIT << 1;
/// Node item: value overwritten by this transaction
const UPDATE_BIT: u32 = flags::USER0_BIT << 2;
/// Node item: insert revived a deleted node rather than splicing a new one
const REUSE_BIT: u32 = flags::USER0_BIT << 3;

const OP_MASK: u32 = INSERT_BIT | DELETE_BIT | UPDATE_BIT;

struct ListNode<K, V> {
    key: K,
    base: Arc<NodeBase<V>>,
    next: Slot<K, V>,
}

/// Edge to a node plus the handle snapshot reads resolve it through
struct Link<K, V> {
    node: Arc<ListNode<K, V>>,
    id: ObjectId<V>,
}

impl<K, V> Link<K, V> {
    /// Indirect link to `node`
    fn to(node: Arc<ListNode<K, V>>) -> Arc<Self> {
        let id = node.base.object_id();
        Arc::new(Self { node, id })
    }
}

type NodeRef<K, V> = Arc<ListNode<K, V>>;
type LinkRef<K, V> = Arc<Link<K, V>>;
type Slot<K, V> = ArcSwapOption<Link<K, V>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Upsert {
    /// Write only if absent
    Insert,
    /// Write unconditionally
    Put,
    /// Write only if present
    Update,
}

impl Upsert {
    fn writes_absent(self) -> bool {
        self != Upsert::Update
    }

    fn writes_present(self) -> bool {
        self != Upsert::Insert
    }
}

/// Transactional sorted map with snapshot reads
///
/// # Example
///
/// ```rust,ignore
/// let stm = Stm::in_memory();
/// let list = TSortedList::new(&stm);
///
/// stm.transaction(|txn| {
///     list.trans_insert(txn, 1, "one")?;
///     list.trans_insert(txn, 2, "two")?;
///     Ok(())
/// })?;
///
/// let snap = stm.take_snapshot();
/// stm.transaction(|txn| list.trans_erase(txn, &1))?;
///
/// assert_eq!(list.snapshot_find(&1, snap.sid()), Some("one"));
/// assert_eq!(list.nontrans_find(&1), None);
/// ```
pub struct TSortedList<K, V> {
    head: Slot<K, V>,
    version: TVersion,
    size: AtomicUsize,
    structure: Mutex<()>,
    clocks: Arc<Clocks>,
    reclaimer: Arc<Reclaimer>,
}

impl<K, V> TSortedList<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Empty list bound to `stm`, registered for background compaction
    pub fn new(stm: &Stm) -> Arc<Self> {
        let list = Self::with_clocks(Arc::clone(stm.clocks()), Arc::clone(stm.reclaimer()));
        let collectable: Arc<dyn SnapshotCollectable> = list.clone();
        stm.register_collectable(&collectable);
        list
    }

    /// Empty list over explicit clocks and reclaimer, not registered anywhere
    pub fn with_clocks(clocks: Arc<Clocks>, reclaimer: Arc<Reclaimer>) -> Arc<Self> {
        Arc::new(Self {
            head: ArcSwapOption::empty(),
            version: TVersion::new(tid::INCREMENT_VALUE),
            size: AtomicUsize::new(0),
            structure: Mutex::new(()),
            clocks,
            reclaimer,
        })
    }

    fn owner(self: &Arc<Self>) -> Arc<dyn TObject> {
        self.clone()
    }

    // ========================================================================
    // Structure
    // ========================================================================

    /// Node holding `key`, linked or not yet reclaimed
    fn find_node(&self, key: &K) -> Option<NodeRef<K, V>> {
        let (_, link) = self.locate(key)?;
        Some(Arc::clone(&link.node))
    }

    /// Link to `key`'s node and the link in front of it
    fn locate(&self, key: &K) -> Option<(Option<LinkRef<K, V>>, LinkRef<K, V>)> {
        let mut prev: Option<LinkRef<K, V>> = None;
        let mut cur = self.head.load_full();
        while let Some(link) = cur {
            match link.node.key.cmp(key) {
                std::cmp::Ordering::Less => {
                    cur = link.node.next.load_full();
                    prev = Some(link);
                }
                std::cmp::Ordering::Equal => return Some((prev, link)),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }

    /// Slot holding the link that follows `prev` (the head for `None`)
    fn slot<'a>(&'a self, prev: &'a Option<LinkRef<K, V>>) -> &'a Slot<K, V> {
        prev.as_ref().map_or(&self.head, |p| &p.node.next)
    }

    fn collect_nodes(&self) -> Vec<NodeRef<K, V>> {
        let mut out = Vec::new();
        let mut cur = self.head.load_full();
        while let Some(link) = cur {
            cur = link.node.next.load_full();
            out.push(Arc::clone(&link.node));
        }
        out
    }

    /// Version of `link`'s node visible at `sid`, plus the handle used
    ///
    /// A newly cached direct handle is swapped into `slot`; the swap does
    /// nothing if `slot` no longer holds `link`.
    fn resolve_link(
        slot: &Slot<K, V>,
        link: &LinkRef<K, V>,
        sid: Sid,
    ) -> Option<(ObjectId<V>, Arc<NodeWrapper<V>>)> {
        let mut id = link.id.clone();
        let found = id.resolve(sid)?;
        let cached = |id: &ObjectId<V>| id.direct_wrapper().map(Arc::as_ptr);
        if cached(&id) != cached(&link.id) {
            let expected = Some(Arc::clone(link));
            let direct = Arc::new(Link {
                node: Arc::clone(&link.node),
                id: id.clone(),
            });
            let _ = slot.compare_and_swap(&expected, Some(direct));
        }
        Some((id, found))
    }

    /// Splice a node for `key` unless one exists; caller holds `structure`
    ///
    /// Returns the new node, or the existing one as `Err`.
    fn splice_locked(
        &self,
        key: &K,
        make: impl FnOnce() -> NodeBase<V>,
    ) -> Result<NodeRef<K, V>, NodeRef<K, V>> {
        let mut prev: Option<LinkRef<K, V>> = None;
        let mut cur = self.head.load_full();
        while let Some(link) = cur.clone() {
            match link.node.key.cmp(key) {
                std::cmp::Ordering::Less => {
                    cur = link.node.next.load_full();
                    prev = Some(link);
                }
                std::cmp::Ordering::Equal => return Err(Arc::clone(&link.node)),
                std::cmp::Ordering::Greater => break,
            }
        }
        let fresh = Arc::new(ListNode {
            key: key.clone(),
            base: Arc::new(make()),
            next: ArcSwapOption::new(cur),
        });
        self.slot(&prev).store(Some(Link::to(Arc::clone(&fresh))));
        Ok(fresh)
    }

    /// Remove `target` from the chain; caller holds `structure`
    fn unlink_locked(&self, target: &NodeRef<K, V>) -> bool {
        let next = target.next.load_full();
        let head = self.head.load_full();
        if head.as_ref().is_some_and(|h| Arc::ptr_eq(&h.node, target)) {
            self.head.store(next);
            return true;
        }
        let mut cur = head;
        while let Some(link) = cur {
            let succ = link.node.next.load_full();
            if succ.as_ref().is_some_and(|s| Arc::ptr_eq(&s.node, target)) {
                link.node.next.store(next);
                return true;
            }
            if link.node.key > target.key {
                break;
            }
            cur = succ;
        }
        false
    }

    /// Unlink a node no snapshot can observe anymore; caller holds `structure`
    ///
    /// Claims the node by poisoning it so a concurrent reuse cannot revive it
    /// mid-unlink. The node stays poisoned forever.
    fn try_unlink_dead_locked(&self, node: &NodeRef<K, V>) -> bool {
        let base = &node.base;
        if base.is_unlinked() || !Self::is_dead(base) {
            return false;
        }
        if !base.version().try_mark_invalid() {
            return false;
        }
        if !Self::is_dead(base) {
            base.version().clear_invalid();
            return false;
        }
        base.set_unlinked();
        self.unlink_locked(node)
    }

    fn is_dead(base: &NodeBase<V>) -> bool {
        let root = base.root();
        root.is_committed() && root.is_deleted() && base.history_is_empty()
    }

    // ========================================================================
    // Transaction helpers
    // ========================================================================

    fn observe_list(txn: &mut Transaction, owner: &Arc<dyn TObject>, version: Tid) -> StmResult<()> {
        if txn.item(owner, LIST_KEY).observe(version) {
            Ok(())
        } else {
            Err(txn.abort(AbortReason::ValidationFailed))
        }
    }

    /// Stage `delta` on the pending size
    ///
    /// Writers do not observe the list version: key presence is already
    /// pinned by the node poison or the node's observed version.
    fn adjust_size(txn: &mut Transaction, owner: &Arc<dyn TObject>, delta: i64) {
        let item = txn.item(owner, LIST_KEY);
        match item.write_value_mut::<i64>() {
            Some(pending) => *pending += delta,
            None => item.add_write(delta),
        }
    }

    /// Staged state of `node` in this transaction
    ///
    /// `Some(Some(v))` if the transaction wrote `v`, `Some(None)` if it erased
    /// the key, `None` if it never wrote the node.
    fn own_state(txn: &Transaction, owner: &Arc<dyn TObject>, node: &NodeRef<K, V>) -> Option<Option<V>> {
        let item = txn.check_item(owner, &ItemKey::object(node))?;
        if item.has_flags(DELETE_BIT) {
            Some(None)
        } else if item.flags() & (INSERT_BIT | UPDATE_BIT) != 0 {
            Some(item.write_value::<V>().cloned())
        } else {
            None
        }
    }

    /// Committed state of a node this transaction has not written
    ///
    /// Returns `(node version, value)`; `value` is `None` if the node is
    /// unlinked or deleted. Aborts on a node poisoned by another transaction.
    fn read_committed(
        txn: &mut Transaction,
        node: &NodeRef<K, V>,
    ) -> StmResult<(Tid, Option<V>)> {
        let base = &node.base;
        if base.is_unlinked() {
            return Ok((0, None));
        }
        let (ver, root) = base.version().stable_read(|| base.root());
        if tid::is_user(ver) {
            if base.is_unlinked() {
                return Ok((0, None));
            }
            return Err(txn.abort(AbortReason::Conflict("poisoned node")));
        }
        if !root.is_committed() || root.is_deleted() {
            return Ok((ver, None));
        }
        Ok((ver, Some(root.cloned())))
    }

    fn observe_node(
        txn: &mut Transaction,
        owner: &Arc<dyn TObject>,
        node: &NodeRef<K, V>,
        version: Tid,
    ) -> StmResult<()> {
        if txn.item(owner, ItemKey::object(node)).observe(version) {
            Ok(())
        } else {
            Err(txn.abort(AbortReason::ValidationFailed))
        }
    }

    // ========================================================================
    // Transactional operations
    // ========================================================================

    /// Value of `key` as seen by `txn`
    ///
    /// Inside a snapshot-scoped transaction this is a snapshot read at
    /// [`Transaction::active_sid`] and registers nothing.
    pub fn trans_find(self: &Arc<Self>, txn: &mut Transaction, key: &K) -> StmResult<Option<V>> {
        txn.ensure_active()?;
        if txn.active_sid() != INVALID_SNAPSHOT {
            return Ok(self.snapshot_find(key, txn.active_sid()));
        }
        let owner = self.owner();
        let (list_v, found) = self.version.stable_read(|| self.find_node(key));
        let Some(node) = found else {
            Self::observe_list(txn, &owner, list_v)?;
            return Ok(None);
        };
        if let Some(own) = Self::own_state(txn, &owner, &node) {
            return Ok(own);
        }
        match Self::read_committed(txn, &node)? {
            (ver, Some(value)) => {
                Self::observe_node(txn, &owner, &node, ver)?;
                Ok(Some(value))
            }
            (_, None) => {
                Self::observe_list(txn, &owner, list_v)?;
                Ok(None)
            }
        }
    }

    /// True if `key` is present as seen by `txn`
    pub fn trans_contains(self: &Arc<Self>, txn: &mut Transaction, key: &K) -> StmResult<bool> {
        Ok(self.trans_find(txn, key)?.is_some())
    }

    /// Insert `key → value` if `key` is absent
    ///
    /// Returns `true` if the key was inserted, `false` if it was already
    /// present (the existing value is left untouched).
    pub fn trans_insert(self: &Arc<Self>, txn: &mut Transaction, key: K, value: V) -> StmResult<bool> {
        let was_present = self.upsert(txn, key, value, Upsert::Insert)?;
        Ok(!was_present)
    }

    /// Insert or overwrite `key → value`
    ///
    /// Returns `true` if the key was already present.
    pub fn trans_put(self: &Arc<Self>, txn: &mut Transaction, key: K, value: V) -> StmResult<bool> {
        self.upsert(txn, key, value, Upsert::Put)
    }

    /// Overwrite the value of `key` if present
    ///
    /// Returns `true` if the key was present and updated.
    pub fn trans_update(self: &Arc<Self>, txn: &mut Transaction, key: K, value: V) -> StmResult<bool> {
        self.upsert(txn, key, value, Upsert::Update)
    }

    /// Returns whether `key` was present before the call
    fn upsert(self: &Arc<Self>, txn: &mut Transaction, key: K, value: V, mode: Upsert) -> StmResult<bool> {
        ensure_writable(txn)?;
        let owner = self.owner();
        loop {
            let (list_v, found) = self.version.stable_read(|| self.find_node(&key));
            match found {
                Some(node) => {
                    if let Some(outcome) = Self::upsert_own(txn, &owner, &node, &value, mode) {
                        return Ok(outcome);
                    }
                    if node.base.is_unlinked() {
                        // reclaimed under us; the next pass splices a fresh node
                        continue;
                    }
                    match Self::read_committed(txn, &node)? {
                        (ver, Some(_)) => {
                            Self::observe_node(txn, &owner, &node, ver)?;
                            if mode.writes_present() {
                                let item = txn.item(&owner, ItemKey::object(&node));
                                item.assign_flags(OP_MASK | REUSE_BIT, UPDATE_BIT);
                                item.add_write(value);
                                txn.require_sid_stamp();
                            }
                            return Ok(true);
                        }
                        (_, None) => {
                            if !mode.writes_absent() {
                                Self::observe_list(txn, &owner, list_v)?;
                                return Ok(false);
                            }
                            Self::reuse(txn, &owner, &node, value)?;
                            return Ok(false);
                        }
                    }
                }
                None => {
                    if !mode.writes_absent() {
                        Self::observe_list(txn, &owner, list_v)?;
                        return Ok(false);
                    }
                    let spliced = {
                        let _guard = self.structure.lock();
                        let pending = value.clone();
                        self.splice_locked(&key, move || NodeBase::pending(pending))
                    };
                    let Ok(node) = spliced else {
                        // raced with another splice of the same key
                        continue;
                    };
                    let item = txn.item(&owner, ItemKey::object(&node));
                    item.add_flags(INSERT_BIT);
                    item.add_write(value);
                    txn.require_sid_stamp();
                    Self::adjust_size(txn, &owner, 1);
                    trace!(txn_id = txn.txn_id(), "pending node spliced");
                    return Ok(false);
                }
            }
        }
    }

    /// Apply an upsert on top of this transaction's own staged write
    ///
    /// Returns `None` if the transaction has not written `node`.
    fn upsert_own(
        txn: &mut Transaction,
        owner: &Arc<dyn TObject>,
        node: &NodeRef<K, V>,
        value: &V,
        mode: Upsert,
    ) -> Option<bool> {
        let item = txn.check_item_mut(owner, &ItemKey::object(node))?;
        let f = item.flags();
        if f & OP_MASK == 0 {
            return None;
        }
        if f & DELETE_BIT == 0 {
            // present through our own insert or update
            if mode.writes_present() {
                item.add_write(value.clone());
            }
            return Some(true);
        }
        if !mode.writes_absent() {
            return Some(false);
        }
        if f & INSERT_BIT != 0 {
            // insert, erase, insert again: back to a plain insert
            item.clear_flags(DELETE_BIT);
        } else {
            // erase of a committed node, then insert: an overwrite
            item.assign_flags(OP_MASK, UPDATE_BIT);
        }
        item.add_write(value.clone());
        Self::adjust_size(txn, owner, 1);
        Some(false)
    }

    /// Revive a deleted node for this transaction's insert
    fn reuse(
        txn: &mut Transaction,
        owner: &Arc<dyn TObject>,
        node: &NodeRef<K, V>,
        value: V,
    ) -> StmResult<()> {
        let base = &node.base;
        if !base.version().try_mark_invalid() {
            return Err(txn.abort(AbortReason::Conflict("deleted node busy")));
        }
        if base.is_unlinked() || !base.root().is_deleted() {
            base.version().clear_invalid();
            return Err(txn.abort(AbortReason::Conflict("deleted node revived")));
        }
        let item = txn.item(owner, ItemKey::object(node));
        // the poison would fail our own validation of an earlier read
        item.remove_read();
        item.assign_flags(OP_MASK | REUSE_BIT, INSERT_BIT | REUSE_BIT);
        item.add_write(value);
        txn.require_sid_stamp();
        Self::adjust_size(txn, owner, 1);
        Ok(())
    }

    /// Remove `key`
    ///
    /// Returns `true` if the key was present.
    pub fn trans_erase(self: &Arc<Self>, txn: &mut Transaction, key: &K) -> StmResult<bool> {
        ensure_writable(txn)?;
        let owner = self.owner();
        let (list_v, found) = self.version.stable_read(|| self.find_node(key));
        let Some(node) = found else {
            Self::observe_list(txn, &owner, list_v)?;
            return Ok(false);
        };

        if let Some(item) = txn.check_item_mut(&owner, &ItemKey::object(&node)) {
            let f = item.flags();
            if f & DELETE_BIT != 0 {
                return Ok(false);
            }
            if f & INSERT_BIT != 0 {
                // our own pending insert: becomes a phantom, unlinked at cleanup
                item.add_flags(DELETE_BIT);
                item.remove_write();
                Self::adjust_size(txn, &owner, -1);
                return Ok(true);
            }
            if f & UPDATE_BIT != 0 {
                item.assign_flags(OP_MASK, DELETE_BIT);
                item.add_write(());
                Self::adjust_size(txn, &owner, -1);
                return Ok(true);
            }
        }

        match Self::read_committed(txn, &node)? {
            (ver, Some(_)) => {
                Self::observe_node(txn, &owner, &node, ver)?;
                let item = txn.item(&owner, ItemKey::object(&node));
                item.assign_flags(OP_MASK | REUSE_BIT, DELETE_BIT);
                item.add_write(());
                txn.require_sid_stamp();
                Self::adjust_size(txn, &owner, -1);
                Ok(true)
            }
            (_, None) => {
                Self::observe_list(txn, &owner, list_v)?;
                Ok(false)
            }
        }
    }

    /// Number of keys as seen by `txn`
    pub fn trans_size(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<usize> {
        txn.ensure_active()?;
        if txn.active_sid() != INVALID_SNAPSHOT {
            return Ok(self.snapshot_scan(txn.active_sid()).len());
        }
        let owner = self.owner();
        let (list_v, size) = self.version.stable_read(|| self.size.load(Ordering::Acquire));
        Self::observe_list(txn, &owner, list_v)?;
        let delta = txn
            .check_item(&owner, &LIST_KEY)
            .and_then(|i| i.write_value::<i64>())
            .copied()
            .unwrap_or(0);
        Ok((size as i64 + delta).max(0) as usize)
    }

    /// Every `(key, value)` in key order as seen by `txn`
    ///
    /// Observes the list version (phantom protection) and every returned
    /// node's version. Aborts on a node another transaction is inserting.
    pub fn trans_scan(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<Vec<(K, V)>> {
        txn.ensure_active()?;
        if txn.active_sid() != INVALID_SNAPSHOT {
            return Ok(self.snapshot_scan(txn.active_sid()));
        }
        let owner = self.owner();
        let (list_v, nodes) = self.version.stable_read(|| self.collect_nodes());
        Self::observe_list(txn, &owner, list_v)?;

        let mut out = Vec::with_capacity(nodes.len());
        for node in &nodes {
            if let Some(own) = Self::own_state(txn, &owner, node) {
                if let Some(v) = own {
                    out.push((node.key.clone(), v));
                }
                continue;
            }
            if let (ver, Some(v)) = Self::read_committed(txn, node)? {
                Self::observe_node(txn, &owner, node, ver)?;
                out.push((node.key.clone(), v));
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Snapshot and non-transactional reads
    // ========================================================================

    /// Value of `key` at snapshot `sid`
    ///
    /// `sid == 0` reads the latest committed state.
    pub fn snapshot_find(&self, key: &K, sid: Sid) -> Option<V> {
        let (prev, link) = self.locate(key)?;
        let (_, wrapper) = Self::resolve_link(self.slot(&prev), &link, sid)?;
        if !wrapper.is_committed() || wrapper.is_deleted() {
            return None;
        }
        Some(wrapper.cloned())
    }

    /// Handle resolving `key`'s object at snapshot `sid`
    ///
    /// The handle caches the resolved version when it is already superseded,
    /// and so does the list link in front of the node.
    pub fn snapshot_handle(&self, key: &K, sid: Sid) -> Option<ObjectId<V>> {
        let (prev, link) = self.locate(key)?;
        let (id, _) = Self::resolve_link(self.slot(&prev), &link, sid)?;
        Some(id)
    }

    /// Every `(key, value)` visible at snapshot `sid`, in key order
    pub fn snapshot_scan(&self, sid: Sid) -> Vec<(K, V)> {
        let mut out = Vec::new();
        let mut prev: Option<LinkRef<K, V>> = None;
        let mut cur = self.head.load_full();
        while let Some(link) = cur {
            if let Some((_, w)) = Self::resolve_link(self.slot(&prev), &link, sid) {
                if w.is_committed() && !w.is_deleted() {
                    out.push((link.node.key.clone(), w.cloned()));
                }
            }
            cur = link.node.next.load_full();
            prev = Some(link);
        }
        out
    }

    /// Links currently holding a direct handle
    pub fn direct_link_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.load_full();
        while let Some(link) = cur {
            if link.id.is_direct() {
                n += 1;
            }
            cur = link.node.next.load_full();
        }
        n
    }

    /// Latest committed value of `key`, outside any transaction
    pub fn nontrans_find(&self, key: &K) -> Option<V> {
        self.snapshot_find(key, INVALID_SNAPSHOT)
    }

    /// Latest committed contents, outside any transaction
    pub fn nontrans_scan(&self) -> Vec<(K, V)> {
        self.snapshot_scan(INVALID_SNAPSHOT)
    }

    /// Committed number of keys, outside any transaction
    pub fn nontrans_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Insert or overwrite `key → value` outside any transaction
    ///
    /// Serializes with committing transactions through the list version and
    /// the node versions, and stamps the write like a commit so snapshots
    /// stay stable. Waits while a transaction holds a pending insert of the
    /// same key. Returns `true` if the key was newly inserted.
    pub fn nontrans_insert(&self, key: K, value: V) -> bool {
        let me = ThreadId::default();
        let backoff = Backoff::new();
        loop {
            self.version.lock(me);
            let outcome = {
                let _guard = self.structure.lock();
                self.nontrans_put_locked(&key, &value, me)
            };
            match outcome {
                Some(true) => {
                    self.size.fetch_add(1, Ordering::AcqRel);
                    self.version.inc_version_unlock();
                    return true;
                }
                Some(false) => {
                    self.version.unlock();
                    return false;
                }
                None => {
                    self.version.unlock();
                    backoff.snooze();
                }
            }
        }
    }

    /// Returns `None` if the node is busy
    fn nontrans_put_locked(&self, key: &K, value: &V, me: ThreadId) -> Option<bool> {
        match self.find_node(key) {
            Some(node) if !node.base.is_unlinked() => {
                let base = &node.base;
                if !base.version().try_lock(me) {
                    return None;
                }
                if base.version().is_invalid() {
                    base.version().unlock();
                    return None;
                }
                let was_deleted = base.root().is_deleted();
                let sid = self.clocks.snapshot.lock_read_next_sid();
                base.install(value.clone(), sid);
                self.clocks.snapshot.unlock_read_next_sid();
                let tid = self.clocks.commit.next();
                let cur = base.version().value();
                base.version()
                    .set_version_unlock(tid.max(tid::next_version(tid::counter(cur))));
                Some(was_deleted)
            }
            _ => {
                let sid = self.clocks.snapshot.lock_read_next_sid();
                let spliced = self.splice_locked(key, || NodeBase::committed(value.clone(), sid));
                self.clocks.snapshot.unlock_read_next_sid();
                // list lock + structure mutex exclude every other splicer
                debug_assert!(spliced.is_ok(), "concurrent splice under structure lock");
                Some(true)
            }
        }
    }

    /// Number of physically linked nodes, including deleted ones
    pub fn node_count(&self) -> usize {
        self.collect_nodes().len()
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Compact every node's history below `horizon` and unlink nodes that
    /// are deleted at every snapshot from `horizon` on
    ///
    /// Removed history entries and nodes are retired to `reclaimer`.
    pub fn collect_garbage(&self, horizon: Sid, reclaimer: &Reclaimer) -> CollectStats {
        let mut stats = CollectStats::default();
        let mut garbage: Vec<Garbage> = Vec::new();
        let mut demoted = 0usize;
        {
            let _guard = self.structure.lock();
            let mut prev: Option<LinkRef<K, V>> = None;
            let mut cur = self.head.load_full();
            while let Some(link) = cur {
                let next = link.node.next.load_full();
                let node = Arc::clone(&link.node);
                let dropped = node.base.cleanup_until(horizon);
                stats.compacted += dropped.len();
                garbage.extend(dropped.into_iter().map(|w| Box::new(w) as Garbage));
                if self.try_unlink_dead_locked(&node) {
                    // prev's slot now skips this node
                    stats.unlinked += 1;
                    garbage.push(Box::new(node));
                    cur = next;
                    continue;
                }
                let stale = link
                    .id
                    .direct_wrapper()
                    .is_some_and(|w| w.c_sid() <= horizon);
                if stale {
                    self.slot(&prev).store(Some(Link::to(node)));
                    demoted += 1;
                }
                cur = next;
                prev = Some(link);
            }
        }
        reclaimer.retire_all(garbage);
        if stats.compacted + stats.unlinked + demoted > 0 {
            trace!(
                horizon,
                compacted = stats.compacted,
                unlinked = stats.unlinked,
                demoted,
                "sorted list collected"
            );
        }
        stats
    }
}

impl<K, V> TObject for TSortedList<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self, item: &mut TransItem, txn: &Transaction) -> bool {
        if item.key().as_const().is_some() {
            return txn.try_lock(item, &self.version);
        }
        let Some(node) = item.key().as_object::<ListNode<K, V>>() else {
            unreachable!("sorted list item with a foreign key");
        };
        let base = Arc::clone(&node.base);
        txn.try_lock(item, base.version())
    }

    fn check(&self, item: &TransItem, _txn: &Transaction) -> bool {
        if item.key().as_const().is_some() {
            return self
                .version
                .check_version(item.read_version(), item.needs_unlock());
        }
        let Some(node) = item.key().as_object::<ListNode<K, V>>() else {
            return false;
        };
        node.base
            .version()
            .check_version(item.read_version(), item.needs_unlock())
    }

    fn install(&self, item: &mut TransItem, txn: &Transaction) {
        if item.key().as_const().is_some() {
            let delta = item.write_value::<i64>().copied().unwrap_or(0);
            if delta >= 0 {
                self.size.fetch_add(delta as usize, Ordering::AcqRel);
            } else {
                self.size.fetch_sub(delta.unsigned_abs() as usize, Ordering::AcqRel);
            }
            // lock stays held; the unlock phase releases it
            self.version
                .set_version(txn.install_version(self.version.value()));
            return;
        }

        let Some(node) = item.key().as_arc::<ListNode<K, V>>() else {
            unreachable!("sorted list item with a foreign key");
        };
        let base = &node.base;
        let sid = txn.stamp_sid();
        if item.has_flags(DELETE_BIT) {
            base.install_tombstone(base.root().cloned(), sid);
        } else {
            let Some(value) = item.take_write_value::<V>() else {
                unreachable!("sorted list write without a value");
            };
            base.install(value, sid);
        }
        // clears the poison of an insert along with the lock
        base.version()
            .set_version_unlock(txn.install_version(base.version().value()));
        item.clear_needs_unlock();
    }

    fn unlock(&self, item: &mut TransItem) {
        if item.key().as_const().is_some() {
            self.version.unlock();
        } else if let Some(node) = item.key().as_object::<ListNode<K, V>>() {
            node.base.version().unlock();
        }
    }

    fn cleanup(&self, item: &mut TransItem, committed: bool) {
        let Some(node) = item.key().as_arc::<ListNode<K, V>>() else {
            return;
        };
        if item.has_flags(INSERT_BIT) {
            debug_assert!(
                node.base.version().is_invalid() || (committed && !item.has_flags(DELETE_BIT)),
                "inserted node lost its poison before cleanup"
            );
            let phantom = item.has_flags(DELETE_BIT);
            if !committed || phantom {
                if item.has_flags(REUSE_BIT) {
                    node.base.version().clear_invalid();
                } else {
                    {
                        let _guard = self.structure.lock();
                        node.base.set_unlinked();
                        self.unlink_locked(&node);
                    }
                    self.reclaimer.retire(Box::new(node));
                }
            }
        } else if committed && item.has_flags(DELETE_BIT) {
            let unlinked = {
                let _guard = self.structure.lock();
                self.try_unlink_dead_locked(&node)
            };
            if unlinked {
                self.reclaimer.retire(Box::new(node));
            }
        }
    }
}

impl<K, V> SnapshotCollectable for TSortedList<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn collect_garbage(&self, horizon: Sid, reclaimer: &Reclaimer) -> CollectStats {
        TSortedList::collect_garbage(self, horizon, reclaimer)
    }
}

impl<K, V> fmt::Debug for TSortedList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TSortedList")
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("version", &self.version)
            .finish()
    }
}
