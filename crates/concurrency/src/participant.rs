//! Transactional participant contract
//!
//! Any data structure that wants to take part in the commit protocol
//! implements [`TObject`]. The protocol never looks inside an item's
//! payload; it only calls back into the item's owner.

use crate::item::TransItem;
use crate::transaction::Transaction;

/// Commit-time callbacks for a transactional data structure
///
/// ## Lifecycle
///
/// ```text
/// lock (writes, canonical order) -> check (reads) -> install (writes)
///      -> unlock (writes still holding a lock) -> cleanup (every item)
/// ```
///
/// A failed `lock` or `check` aborts the transaction; every lock acquired so
/// far is released through `unlock`, then `cleanup(false)` runs.
pub trait TObject: Send + Sync + 'static {
    /// Acquire whatever the item's write needs
    ///
    /// Returns `false` to abort. On success the implementation must call
    /// [`TransItem::set_needs_unlock`] for any lock it actually took.
    fn lock(&self, item: &mut TransItem, txn: &Transaction) -> bool;

    /// Re-validate the item's read observation
    fn check(&self, item: &TransItem, txn: &Transaction) -> bool;

    /// Publish the item's write at [`Transaction::commit_tid`]
    ///
    /// Implementations that release their lock here must clear
    /// [`TransItem::needs_unlock`].
    fn install(&self, item: &mut TransItem, txn: &Transaction);

    /// Release a lock taken in [`lock`](Self::lock) without publishing
    fn unlock(&self, item: &mut TransItem);

    /// Reclaim per-transaction state once the outcome is known
    fn cleanup(&self, _item: &mut TransItem, _committed: bool) {}
}
