//! Snapshot behavior tests (Tier 2)
//!
//! - The sid1/sid2 sorted-list scenario
//! - Snapshot stability while writers keep committing
//! - Deferred unlink of deleted nodes
//! - Snapshot guards and maintenance interplay

use crate::test_utils::{run_with_shared, stm_with_list};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_stm::StmError;

#[test]
fn two_snapshot_scenario() {
    let (stm, list) = stm_with_list();

    stm.transaction(|txn| {
        list.trans_insert(txn, 1, 2)?;
        list.trans_insert(txn, 2, 3)?;
        list.trans_insert(txn, 3, 1)?;
        Ok(())
    })
    .unwrap();
    let sid1 = stm.take_snapshot_id();

    stm.transaction(|txn| {
        list.trans_update(txn, 1, 1)?;
        list.trans_update(txn, 2, 2)?;
        Ok(())
    })
    .unwrap();
    let sid2 = stm.take_snapshot_id();

    let mut at1 = stm.begin_at(sid1);
    assert_eq!(list.trans_find(&mut at1, &1).unwrap(), Some(2));
    assert_eq!(list.trans_find(&mut at1, &2).unwrap(), Some(3));
    assert_eq!(list.trans_find(&mut at1, &3).unwrap(), Some(1));
    assert_eq!(list.trans_find(&mut at1, &4).unwrap(), None);
    at1.commit().unwrap();

    let mut at2 = stm.begin_at(sid2);
    assert_eq!(
        list.trans_scan(&mut at2).unwrap(),
        vec![(1, 1), (2, 2), (3, 1)]
    );
    assert_eq!(list.trans_find(&mut at2, &4).unwrap(), None);
    assert_eq!(list.trans_size(&mut at2).unwrap(), 3);
    at2.commit().unwrap();

    stm.release_snapshot(sid1);
    stm.release_snapshot(sid2);
}

#[test]
fn snapshot_reads_stable_across_threads() {
    const KEYS: u64 = 16;

    let (stm, list) = stm_with_list();
    for k in 0..KEYS {
        list.nontrans_insert(k, 0);
    }
    let sid = stm.take_snapshot_id();
    let expected: Vec<(u64, u64)> = (0..KEYS).map(|k| (k, 0)).collect();
    let stop = Arc::new(AtomicBool::new(false));

    let mismatches = run_with_shared(
        6,
        (Arc::clone(&stm), Arc::clone(&list), Arc::clone(&stop), expected),
        move |i, (stm, list, stop, expected)| {
            if i < 2 {
                // writers
                for round in 1..=200u64 {
                    let key = (round + i as u64) % KEYS;
                    stm.atomically(|txn| {
                        if round % 7 == 0 {
                            list.trans_erase(txn, &key)?;
                        } else {
                            list.trans_put(txn, key, round)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                    if round % 50 == 0 {
                        stm.run_maintenance();
                    }
                }
                stop.store(true, Ordering::Release);
                return 0;
            }
            let mut bad = 0;
            while !stop.load(Ordering::Acquire) {
                if &list.snapshot_scan(sid) != expected {
                    bad += 1;
                }
                if list.snapshot_find(&(i as u64), sid) != Some(0) {
                    bad += 1;
                }
            }
            bad
        },
    );

    assert_eq!(mismatches.iter().sum::<usize>(), 0);
    stm.release_snapshot(sid);
}

#[test]
fn deleted_key_visible_to_earlier_snapshot_only() {
    let (stm, list) = stm_with_list();
    list.nontrans_insert(7, 70);

    let s1 = stm.take_snapshot();
    stm.transaction(|txn| list.trans_erase(txn, &7)).unwrap();
    let s2 = stm.take_snapshot();

    assert_eq!(list.snapshot_find(&7, s1.sid()), Some(70));
    assert_eq!(list.snapshot_find(&7, s2.sid()), None);
    assert_eq!(list.nontrans_find(&7), None);

    // maintenance must not reclaim what s1 still reads
    for _ in 0..3 {
        stm.run_maintenance();
    }
    assert_eq!(list.snapshot_find(&7, s1.sid()), Some(70));
    assert_eq!(list.node_count(), 1);

    drop(s2);
    drop(s1);
    stm.run_maintenance();
    assert_eq!(list.node_count(), 0);
    assert_eq!(stm.stats().live_snapshots, 0);
}

#[test]
fn snapshot_transaction_rejects_writes_but_reads() {
    let (stm, list) = stm_with_list();
    list.nontrans_insert(1, 1);
    let snap = stm.take_snapshot();

    let err = snap
        .read(|txn| list.trans_put(txn, 2, 2))
        .unwrap_err();
    assert!(matches!(err, StmError::InvalidState { .. }));

    let seen = snap.read(|txn| list.trans_scan(txn)).unwrap();
    assert_eq!(seen, vec![(1, 1)]);
}

#[test]
fn compaction_releases_history_after_release() {
    let (stm, list) = stm_with_list();
    list.nontrans_insert(1, 0);

    let mut sids = Vec::new();
    for v in 1..=5 {
        sids.push(stm.take_snapshot_id());
        stm.transaction(|txn| list.trans_put(txn, 1, v)).unwrap();
    }
    let handle = list.snapshot_handle(&1, 0).unwrap();
    assert_eq!(handle.base().history_len(), 5);

    for (i, sid) in sids.iter().enumerate() {
        assert_eq!(list.snapshot_find(&1, *sid), Some(i as u64));
    }

    // releasing the oldest two lets their versions go
    stm.release_snapshot(sids[0]);
    stm.release_snapshot(sids[1]);
    let stats = stm.run_maintenance();
    assert_eq!(stats.history.compacted, 2);
    assert_eq!(handle.base().history_len(), 3);
    assert_eq!(list.snapshot_find(&1, sids[2]), Some(2));

    for sid in &sids[2..] {
        stm.release_snapshot(*sid);
    }
    stm.run_maintenance();
    assert_eq!(handle.base().history_len(), 0);
    assert_eq!(list.nontrans_find(&1), Some(5));
}
