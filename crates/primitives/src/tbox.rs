//! TBox: single transactional value under OCC
//!
//! ## Design
//!
//! A value guarded by one version cell. Reads record the observed version;
//! writes are buffered in the transaction item and published at commit while
//! the cell is locked.
//!
//! ## Purity Requirement
//!
//! The `modify()` closure may be called once per attempt when the enclosing
//! transaction is retried. Closures must be pure functions of the current
//! value.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use strata_concurrency::{ItemKey, TObject, TransItem, Transaction};
use strata_core::{tid, AbortReason, StmResult, TVersion, ThreadId};

use crate::ensure_writable;

const VALUE_KEY: ItemKey = ItemKey::Const(0);

/// Transactional cell holding one `T`
///
/// # Example
///
/// ```rust,ignore
/// let stm = Stm::in_memory();
/// let balance = TBox::new(100u64);
///
/// stm.atomically(|txn| balance.modify(txn, |v| v - 30))?;
/// assert_eq!(balance.nontrans_read(), 70);
/// ```
pub struct TBox<T> {
    version: TVersion,
    value: RwLock<T>,
}

impl<T: Clone + Send + Sync + 'static> TBox<T> {
    /// New cell holding `value`
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            version: TVersion::new(tid::INCREMENT_VALUE),
            value: RwLock::new(value),
        })
    }

    fn owner(self: &Arc<Self>) -> Arc<dyn TObject> {
        self.clone()
    }

    /// Current value as seen by `txn`
    ///
    /// Aborts if the cell changed since an earlier read in the same
    /// transaction, so a transaction never acts on two different values.
    pub fn read(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<T> {
        txn.ensure_active()?;
        let owner = self.owner();
        if let Some(v) = txn
            .check_item(&owner, &VALUE_KEY)
            .and_then(|i| i.write_value::<T>())
        {
            return Ok(v.clone());
        }
        let (ver, value) = self.version.stable_read(|| self.value.read().clone());
        let item = txn.item(&owner, VALUE_KEY);
        if item.has_read() && !tid::same_version(item.read_version(), ver) {
            return Err(txn.abort(AbortReason::ValidationFailed));
        }
        if !item.observe(ver) {
            return Err(txn.abort(AbortReason::ValidationFailed));
        }
        Ok(value)
    }

    /// Buffer `value` as this transaction's write
    pub fn write(self: &Arc<Self>, txn: &mut Transaction, value: T) -> StmResult<()> {
        ensure_writable(txn)?;
        let owner = self.owner();
        txn.item(&owner, VALUE_KEY).add_write(value);
        Ok(())
    }

    /// Read, apply `f`, write back; returns the new value
    pub fn modify<F>(self: &Arc<Self>, txn: &mut Transaction, f: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let next = f(self.read(txn)?);
        self.write(txn, next.clone())?;
        Ok(next)
    }

    /// Latest committed value, outside any transaction
    pub fn nontrans_read(&self) -> T {
        self.version.stable_read(|| self.value.read().clone()).1
    }

    /// Overwrite the value outside any transaction
    ///
    /// Waits for a committing writer; bumps the version so concurrent
    /// readers fail validation.
    pub fn nontrans_write(&self, value: T) {
        self.version.lock(ThreadId::default());
        *self.value.write() = value;
        self.version.inc_version_unlock();
    }

    /// Current version word
    pub fn version(&self) -> u64 {
        self.version.value()
    }
}

impl<T: Clone + Send + Sync + 'static> TObject for TBox<T> {
    fn lock(&self, item: &mut TransItem, txn: &Transaction) -> bool {
        txn.try_lock(item, &self.version)
    }

    fn check(&self, item: &TransItem, _txn: &Transaction) -> bool {
        self.version
            .check_version(item.read_version(), item.needs_unlock())
    }

    fn install(&self, item: &mut TransItem, txn: &Transaction) {
        let Some(value) = item.take_write_value::<T>() else {
            unreachable!("TBox write without a value");
        };
        *self.value.write() = value;
        self.version
            .set_version_unlock(txn.install_version(self.version.value()));
        item.clear_needs_unlock();
    }

    fn unlock(&self, _item: &mut TransItem) {
        self.version.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for TBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TBox")
            .field("value", &*self.value.read())
            .field("version", &self.version)
            .finish()
    }
}
