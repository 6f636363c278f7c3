//! Stress tests (Tier 3)
//!
//! These tests are NOT run by default (marked with #[ignore]).
//! Run with: cargo test --test stm_comprehensive stress -- --ignored

use crate::test_utils::{run_with_shared, stm_with_list};
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

#[test]
#[ignore]
fn stress_mixed_list_workload_with_snapshots() {
    const THREADS: usize = 8;
    const OPS: usize = 2_000;
    const KEYS: u64 = 64;

    let (stm, list) = stm_with_list();
    let results = run_with_shared(
        THREADS,
        (Arc::clone(&stm), Arc::clone(&list)),
        |i, (stm, list)| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(i as u64);
            let mut net: i64 = 0;
            for n in 0..OPS {
                let key = rng.gen_range(0..KEYS);
                match rng.gen_range(0..10) {
                    0..=3 => {
                        if stm.atomically(|txn| list.trans_insert(txn, key, n as u64)).unwrap() {
                            net += 1;
                        }
                    }
                    4..=5 => {
                        if stm.atomically(|txn| list.trans_erase(txn, &key)).unwrap() {
                            net -= 1;
                        }
                    }
                    6..=7 => {
                        let seen = stm.atomically(|txn| list.trans_scan(txn)).unwrap();
                        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
                    }
                    8 => {
                        let snap = stm.take_snapshot();
                        let first = list.snapshot_scan(snap.sid());
                        let as_map: BTreeMap<u64, u64> = first.iter().copied().collect();
                        assert_eq!(as_map.len(), first.len());
                        assert_eq!(list.snapshot_scan(snap.sid()), first);
                    }
                    _ => {
                        stm.run_maintenance();
                    }
                }
            }
            net
        },
    );

    let net: i64 = results.iter().sum();
    stm.run_maintenance();
    assert_eq!(list.nontrans_scan().len() as i64, net);
    assert_eq!(list.nontrans_size() as i64, net);
}
