//! MvBox: single transactional value with multi-version history
//!
//! Reads resolve against the history chain at the transaction's read
//! timestamp and never block on writers that commit later. Writes append a
//! pending version at the commit timestamp during the lock phase; validation
//! checks that the version read is still the one visible just before the
//! commit.
//!
//! A box whose newest visible version is a deletion, with no reader left
//! that could see an older one, fires its delete callback on the next
//! maintenance pass. The box stays registered, so writing to it again
//! revives it and its history keeps being collected.

use std::fmt;
use std::sync::Arc;
use strata_concurrency::{ItemKey, MvCollectable, MvHistory, MvObject, TObject, TransItem, Transaction};
use strata_core::{StmResult, Tid};
use strata_engine::Stm;

use crate::ensure_writable;

const VALUE_KEY: ItemKey = ItemKey::Const(0);

type Version<T> = Arc<MvHistory<T>>;

/// Multi-version transactional cell
pub struct MvBox<T> {
    obj: Arc<MvObject<T>>,
}

impl<T: Clone + Send + Sync + 'static> MvBox<T> {
    /// New box holding `initial` (`None` starts it deleted), registered
    /// with `stm` for history collection
    pub fn new(stm: &Stm, initial: Option<T>) -> Arc<Self> {
        let obj = Arc::new(MvObject::new(initial));
        let collectable: Arc<dyn MvCollectable> = obj.clone();
        stm.register_mv(&collectable);
        Arc::new(Self { obj })
    }

    fn owner(self: &Arc<Self>) -> Arc<dyn TObject> {
        self.clone()
    }

    /// Value visible to `txn`, `None` if deleted
    ///
    /// Repeated reads in one transaction return the same version.
    pub fn read(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<Option<T>> {
        txn.ensure_active()?;
        let owner = self.owner();
        if let Some(item) = txn.check_item(&owner, &VALUE_KEY) {
            if let Some(staged) = item.write_value::<Option<T>>() {
                return Ok(staged.clone());
            }
            if let Some(seen) = item.read_value::<Version<T>>() {
                return Ok(seen.value().cloned());
            }
        }
        let Some(seen) = self.obj.read_at(txn.read_tid()) else {
            return Ok(None);
        };
        let value = seen.value().cloned();
        txn.item(&owner, VALUE_KEY).add_read_data(seen);
        Ok(value)
    }

    /// Buffer `value` as this transaction's write
    pub fn write(self: &Arc<Self>, txn: &mut Transaction, value: T) -> StmResult<()> {
        self.stage(txn, Some(value))
    }

    /// Buffer a deletion
    pub fn delete(self: &Arc<Self>, txn: &mut Transaction) -> StmResult<()> {
        self.stage(txn, None)
    }

    fn stage(self: &Arc<Self>, txn: &mut Transaction, value: Option<T>) -> StmResult<()> {
        ensure_writable(txn)?;
        let owner = self.owner();
        txn.item(&owner, VALUE_KEY).add_write(value);
        Ok(())
    }

    /// Latest committed value, outside any transaction
    pub fn nontrans_read(&self) -> Option<T> {
        self.obj.nontrans_read().and_then(|v| v.value().cloned())
    }

    /// Commit `value` at a fresh timestamp from `stm`'s clock
    ///
    /// Waits while a transactional writer is pending. Returns `false` if a
    /// newer version won the race for the head.
    pub fn nontrans_write(&self, stm: &Stm, value: Option<T>) -> bool {
        let tid = stm.clocks().commit.next();
        self.obj.nontrans_write(tid, value)
    }

    /// Run `f` once the box is collected as deleted
    pub fn set_delete_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.obj.set_delete_callback(f);
    }

    /// Versions currently retained
    pub fn chain_len(&self) -> usize {
        self.obj.chain_len()
    }

    /// Write timestamp of the newest version
    pub fn head_tid(&self) -> Tid {
        self.obj.head().wtid()
    }
}

impl<T: Clone + Send + Sync + 'static> TObject for MvBox<T> {
    fn lock(&self, item: &mut TransItem, txn: &Transaction) -> bool {
        let Some(value) = item.take_write_value::<Option<T>>() else {
            return false;
        };
        match self.obj.cp_lock(txn.commit_tid(), value) {
            Some(pending) => {
                item.add_write(pending);
                item.set_needs_unlock();
                true
            }
            None => false,
        }
    }

    fn check(&self, item: &TransItem, txn: &Transaction) -> bool {
        let Some(seen) = item.read_value::<Version<T>>() else {
            return false;
        };
        let at = if txn.has_commit_writes() {
            txn.commit_tid() - 1
        } else {
            txn.read_tid()
        };
        self.obj.cp_check(seen, at)
    }

    fn install(&self, item: &mut TransItem, _txn: &Transaction) {
        let Some(pending) = item.write_value::<Version<T>>() else {
            unreachable!("MvBox install without a locked version");
        };
        self.obj.cp_install(pending);
        item.clear_needs_unlock();
    }

    fn unlock(&self, item: &mut TransItem) {
        if let Some(pending) = item.write_value::<Version<T>>() {
            self.obj.cp_abort(pending);
        }
    }
}

impl<T> fmt::Debug for MvBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvBox").field("obj", &self.obj).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_read_your_writes_and_commit() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(1u32));
        stm.transaction(|txn| {
            assert_eq!(b.read(txn)?, Some(1));
            b.write(txn, 2)?;
            assert_eq!(b.read(txn)?, Some(2));
            Ok(())
        })
        .unwrap();
        assert_eq!(b.nontrans_read(), Some(2));
        assert_eq!(b.chain_len(), 2);
    }

    #[test]
    fn test_reader_keeps_its_version() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(1u32));

        let mut reader = stm.begin();
        assert_eq!(b.read(&mut reader).unwrap(), Some(1));

        assert!(b.nontrans_write(&stm, Some(2)));
        assert_eq!(b.read(&mut reader).unwrap(), Some(1));
        drop(reader);

        assert_eq!(b.nontrans_read(), Some(2));
    }

    #[test]
    fn test_read_only_reader_commits_after_newer_write() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(1u32));

        let mut reader = stm.begin();
        assert_eq!(b.read(&mut reader).unwrap(), Some(1));

        stm.transaction(|txn| b.write(txn, 2)).unwrap();
        assert_eq!(b.read(&mut reader).unwrap(), Some(1));
        assert!(reader.commit().is_ok());

        assert_eq!(b.nontrans_read(), Some(2));
    }

    #[test]
    fn test_read_then_write_conflicts_with_intervening_commit() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(0u32));

        let mut t1 = stm.begin();
        let v = b.read(&mut t1).unwrap().unwrap();
        b.write(&mut t1, v + 1).unwrap();

        stm.transaction(|txn| b.write(txn, 100)).unwrap();

        assert!(t1.commit().is_err());
        assert_eq!(b.nontrans_read(), Some(100));
    }

    #[test]
    fn test_delete_then_collect_fires_callback() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(5u32));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        b.set_delete_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stm.transaction(|txn| b.delete(txn)).unwrap();
        assert_eq!(b.nontrans_read(), None);

        let stats = stm.run_maintenance();
        assert_eq!(stats.mvcc.deleted, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(b.chain_len(), 1);
    }

    #[test]
    fn test_revived_box_keeps_being_collected() {
        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(0u32));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        b.set_delete_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stm.transaction(|txn| b.delete(txn)).unwrap();
        stm.run_maintenance();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        for i in 1..=50 {
            stm.transaction(|txn| b.write(txn, i)).unwrap();
        }
        let stats = stm.run_maintenance();
        assert_eq!(stats.mvcc.deleted, 0);
        assert_eq!(b.chain_len(), 1);
        assert_eq!(b.nontrans_read(), Some(50));

        stm.transaction(|txn| b.delete(txn)).unwrap();
        let stats = stm.run_maintenance();
        assert_eq!(stats.mvcc.deleted, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_readers_never_lose_their_version_under_gc() {
        const READERS: usize = 4;
        const ROUNDS: usize = 500;

        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let spawn_loop = |body: Box<dyn Fn() + Send>| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    body();
                }
            })
        };
        let writer = {
            let (stm, b) = (Arc::clone(&stm), Arc::clone(&b));
            spawn_loop(Box::new(move || {
                stm.atomically(|txn| {
                    let v = b.read(txn)?.unwrap_or(0);
                    b.write(txn, v + 1)
                })
                .unwrap();
            }))
        };
        let collector = {
            let stm = Arc::clone(&stm);
            spawn_loop(Box::new(move || {
                stm.run_maintenance();
            }))
        };

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let (stm, b) = (Arc::clone(&stm), Arc::clone(&b));
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut txn = stm.begin();
                        let seen = b.read(&mut txn).unwrap();
                        assert!(seen.is_some(), "version at read_tid was collected");
                    }
                })
            })
            .collect();
        for h in readers {
            h.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        writer.join().unwrap();
        collector.join().unwrap();
    }

    #[test]
    fn test_concurrent_increments() {
        const THREADS: usize = 4;
        const PER_THREAD: u32 = 100;

        let stm = Stm::in_memory();
        let b = MvBox::new(&stm, Some(0u32));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (stm, b, barrier) = (Arc::clone(&stm), Arc::clone(&b), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..PER_THREAD {
                        stm.atomically(|txn| {
                            let v = b.read(txn)?.unwrap_or(0);
                            b.write(txn, v + 1)
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(b.nontrans_read(), Some(THREADS as u32 * PER_THREAD));
        stm.run_maintenance();
        assert_eq!(b.chain_len(), 1);
    }
}
