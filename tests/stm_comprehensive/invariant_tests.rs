//! Core invariant tests (Tier 1)
//!
//! - Atomicity: multi-object writes appear together or not at all
//! - No lost update: concurrent increments all survive
//! - Version monotonicity: committed versions strictly increase
//! - History ordering: snapshot histories stay sorted by s_sid

use crate::test_utils::{contended_stm, run_with_shared, stm_with_list, unique_key};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_stm::{MvBox, StmError, TBox, TSortedList};

// =============================================================================
// Atomicity
// =============================================================================

mod atomicity {
    use super::*;

    #[test]
    fn transfers_never_expose_partial_state() {
        const ACCOUNTS: usize = 4;
        const INITIAL: u64 = 1_000;

        let stm = contended_stm();
        let accounts: Vec<Arc<TBox<u64>>> = (0..ACCOUNTS).map(|_| TBox::new(INITIAL)).collect();
        let done = Arc::new(AtomicBool::new(false));
        let torn = Arc::new(AtomicUsize::new(0));

        let results = run_with_shared(
            5,
            (Arc::clone(&stm), accounts.clone(), Arc::clone(&done), Arc::clone(&torn)),
            |i, (stm, accounts, done, torn)| {
                if i == 0 {
                    // auditor
                    while !done.load(Ordering::Acquire) {
                        let total = stm
                            .atomically(|txn| {
                                let mut sum = 0;
                                for a in accounts {
                                    sum += a.read(txn)?;
                                }
                                Ok(sum)
                            })
                            .unwrap();
                        if total != ACCOUNTS as u64 * INITIAL {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    return 0;
                }
                for n in 0..200 {
                    let from = (i + n) % ACCOUNTS;
                    let to = (i + n + 1) % ACCOUNTS;
                    stm.atomically(|txn| {
                        let a = accounts[from].read(txn)?;
                        if a == 0 {
                            return Ok(());
                        }
                        accounts[from].write(txn, a - 1)?;
                        accounts[to].modify(txn, |b| b + 1)?;
                        Ok(())
                    })
                    .unwrap();
                }
                if i == 4 {
                    done.store(true, Ordering::Release);
                }
                1
            },
        );

        done.store(true, Ordering::Release);
        assert_eq!(results.iter().sum::<usize>(), 4);
        assert_eq!(torn.load(Ordering::Relaxed), 0);
        let total: u64 = accounts.iter().map(|a| a.nontrans_read()).sum();
        assert_eq!(total, ACCOUNTS as u64 * INITIAL);
    }

    #[test]
    fn failed_body_publishes_nothing() {
        let (stm, list) = stm_with_list();
        let cell = TBox::new(0u64);
        let key = unique_key();

        let result: Result<(), StmError> = stm.transaction(|txn| {
            list.trans_insert(txn, key, 1)?;
            cell.write(txn, 1)?;
            Err(StmError::InvalidState {
                state: "body gave up".into(),
            })
        });

        assert!(result.is_err());
        assert_eq!(list.nontrans_find(&key), None);
        assert_eq!(list.node_count(), 0);
        assert_eq!(cell.nontrans_read(), 0);
    }

    #[test]
    fn list_and_box_commit_together() {
        let (stm, list) = stm_with_list();
        let count = TBox::new(0u64);

        let results = run_with_shared(
            4,
            (Arc::clone(&stm), Arc::clone(&list), Arc::clone(&count)),
            |i, (stm, list, count)| {
                for j in 0..50u64 {
                    let key = j * 4 + i as u64;
                    stm.atomically(|txn| {
                        if list.trans_insert(txn, key, key)? {
                            count.modify(txn, |c| c + 1)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                }
            },
        );

        assert_eq!(results.len(), 4);
        let size = stm.atomically(|txn| list.trans_size(txn)).unwrap() as u64;
        assert_eq!(size, 200);
        assert_eq!(count.nontrans_read(), size);
    }
}

// =============================================================================
// No Lost Update
// =============================================================================

mod no_lost_update {
    use super::*;

    #[test]
    fn occ_counter() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 200;

        let stm = contended_stm();
        let counter = TBox::new(0u64);
        run_with_shared(THREADS, (Arc::clone(&stm), Arc::clone(&counter)), |_, (stm, counter)| {
            for _ in 0..PER_THREAD {
                stm.atomically(|txn| counter.modify(txn, |v| v + 1)).unwrap();
            }
        });
        assert_eq!(counter.nontrans_read(), THREADS as u64 * PER_THREAD);
    }

    #[test]
    fn mvcc_counter() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 100;

        let stm = contended_stm();
        let counter = MvBox::new(&stm, Some(0u64));
        run_with_shared(THREADS, (Arc::clone(&stm), Arc::clone(&counter)), |_, (stm, counter)| {
            for _ in 0..PER_THREAD {
                stm.atomically(|txn| {
                    let v = counter.read(txn)?.unwrap_or(0);
                    counter.write(txn, v + 1)
                })
                .unwrap();
            }
        });
        assert_eq!(counter.nontrans_read(), Some(THREADS as u64 * PER_THREAD));
    }

    #[test]
    fn list_value_counter() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 100;

        let (stm, list) = stm_with_list();
        let key = unique_key();
        list.nontrans_insert(key, 0);

        run_with_shared(THREADS, (Arc::clone(&stm), Arc::clone(&list)), move |_, (stm, list)| {
            for _ in 0..PER_THREAD {
                stm.atomically(|txn| {
                    let v = list.trans_find(txn, &key)?.unwrap_or(0);
                    list.trans_update(txn, key, v + 1)
                })
                .unwrap();
            }
        });
        assert_eq!(list.nontrans_find(&key), Some(THREADS as u64 * PER_THREAD));
    }
}

// =============================================================================
// Version Monotonicity
// =============================================================================

mod version_monotonicity {
    use super::*;
    use strata_stm::tid::counter;
    use strata_stm::Tid;

    #[test]
    fn tbox_versions_strictly_increase() {
        let stm = contended_stm();
        let cell = TBox::new(0u64);
        let mut last = counter(cell.version());
        for i in 1..=50 {
            stm.atomically(|txn| cell.write(txn, i)).unwrap();
            let now = counter(cell.version());
            assert!(now > last, "version went from {last} to {now}");
            last = now;
        }
    }

    #[test]
    fn mvbox_history_timestamps_strictly_increase_under_contention() {
        let stm = contended_stm();
        let cell = MvBox::new(&stm, Some(0u64));
        let observed = run_with_shared(
            4,
            (Arc::clone(&stm), Arc::clone(&cell)),
            |_, (stm, cell)| {
                let mut tids = Vec::new();
                for _ in 0..50 {
                    stm.atomically(|txn| {
                        let v = cell.read(txn)?.unwrap_or(0);
                        cell.write(txn, v + 1)
                    })
                    .unwrap();
                    tids.push(cell.head_tid());
                }
                tids
            },
        );
        for tids in observed {
            assert!(tids.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(cell.nontrans_read(), Some(200));
        assert_eq!(cell.chain_len(), 201);
    }

    #[test]
    fn commit_tids_are_unique() {
        let stm = contended_stm();
        let cell = TBox::new(0u64);
        let tids = run_with_shared(
            4,
            (Arc::clone(&stm), Arc::clone(&cell)),
            |_, (stm, cell)| {
                let mut out = Vec::new();
                for _ in 0..50 {
                    let mut txn = stm.begin();
                    cell.write(&mut txn, 1).unwrap();
                    if let Ok(tid) = txn.commit() {
                        out.push(tid);
                    }
                }
                out
            },
        );
        let mut all: Vec<Tid> = tids.into_iter().flatten().collect();
        let n = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), n);
    }
}

// =============================================================================
// History Ordering
// =============================================================================

mod history_ordering {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn histories_sorted_and_searches_respect_windows(
            writes in prop::collection::vec((0u64..4, any::<u32>(), any::<bool>(), any::<bool>()), 1..40)
        ) {
            let stm = contended_stm();
            let list: Arc<TSortedList<u64, u32>> = TSortedList::new(&stm);
            let mut sids = Vec::new();

            for (key, value, erase, snap) in &writes {
                stm.transaction(|txn| {
                    if *erase {
                        list.trans_erase(txn, key)?;
                    } else {
                        list.trans_put(txn, *key, *value)?;
                    }
                    Ok(())
                }).unwrap();
                if *snap {
                    sids.push(stm.take_snapshot_id());
                }
            }

            for key in 0u64..4 {
                let Some(handle) = list.snapshot_handle(&key, 0) else { continue };
                let windows = handle.base().history_windows();
                prop_assert!(windows.windows(2).all(|w| w[0].0 < w[1].0));
                prop_assert!(windows.iter().all(|(s, c)| s < c));
                for sid in &sids {
                    if let Some(found) = handle.base().search_history(*sid) {
                        prop_assert!(found.c_sid() > *sid);
                        prop_assert!(found.s_sid() <= *sid);
                    }
                }
            }
        }
    }
}
