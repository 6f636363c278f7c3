//! Abort and retry tests (Tier 2)
//!
//! A transaction that loses a conflict and re-runs must land in the same
//! state as if the winner had simply run first.

use crate::test_utils::{contended_stm, stm_with_list};
use std::cell::Cell;
use strata_stm::{AbortReason, RetryConfig, StmError, TBox, TSortedList};

/// Body under test: insert `key` with the current size as its value
fn insert_with_size(
    list: &std::sync::Arc<TSortedList<u64, u64>>,
    txn: &mut strata_stm::Transaction,
    key: u64,
) -> strata_stm::StmResult<bool> {
    let size = list.trans_size(txn)? as u64;
    list.trans_insert(txn, key, size)
}

#[test]
fn retry_after_conflict_matches_serial_order() {
    // contended run: the competing insert commits in the middle of attempt 1
    let (stm, list) = stm_with_list();
    let attempts = Cell::new(0);
    let inserted = stm
        .transaction_with_retry(&RetryConfig::new().with_base_delay_ms(0), |txn| {
            attempts.set(attempts.get() + 1);
            let r = insert_with_size(&list, txn, 5)?;
            if attempts.get() == 1 {
                stm.transaction(|other| list.trans_insert(other, 6, 60))?;
            }
            Ok(r)
        })
        .unwrap();
    assert!(inserted);
    assert_eq!(attempts.get(), 2);

    // serial run: the competing insert simply goes first
    let (serial_stm, serial) = stm_with_list();
    serial_stm
        .transaction(|txn| serial.trans_insert(txn, 6, 60))
        .unwrap();
    serial_stm
        .transaction(|txn| insert_with_size(&serial, txn, 5))
        .unwrap();

    assert_eq!(list.nontrans_scan(), serial.nontrans_scan());
    assert_eq!(list.nontrans_scan(), vec![(5, 1), (6, 60)]);
    assert_eq!(list.node_count(), 2, "attempt 1's pending node was unlinked");
}

#[test]
fn aborted_attempt_leaves_no_trace_in_boxes() {
    let stm = contended_stm();
    let a = TBox::new(0u64);
    let b = TBox::new(0u64);
    let attempts = Cell::new(0);

    stm.transaction_with_retry(&RetryConfig::new().with_base_delay_ms(0), |txn| {
        attempts.set(attempts.get() + 1);
        let seen = a.read(txn)?;
        b.write(txn, seen + 10)?;
        if attempts.get() == 1 {
            a.nontrans_write(5);
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(attempts.get(), 2);
    assert_eq!(b.nontrans_read(), 15);
}

#[test]
fn retry_limit_reports_last_reason() {
    let stm = contended_stm();
    let config = RetryConfig::new()
        .with_max_retries(2)
        .with_base_delay_ms(0);
    let attempts = Cell::new(0);

    let err = stm
        .transaction_with_retry(&config, |txn| -> Result<(), StmError> {
            attempts.set(attempts.get() + 1);
            Err(txn.abort(AbortReason::Conflict("always")))
        })
        .unwrap_err();

    assert_eq!(attempts.get(), 3);
    match err {
        StmError::RetryLimitExceeded {
            attempts,
            last_reason,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_reason, AbortReason::Conflict("always"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn non_conflict_errors_are_not_retried() {
    let stm = contended_stm();
    let attempts = Cell::new(0);
    let snap = stm.take_snapshot_id();
    let list: std::sync::Arc<TSortedList<u64, u64>> = TSortedList::new(&stm);

    let err = stm
        .atomically(|txn| {
            attempts.set(attempts.get() + 1);
            txn.set_active_sid(snap);
            list.trans_insert(txn, 1, 1)
        })
        .unwrap_err();

    assert_eq!(attempts.get(), 1);
    assert!(matches!(err, StmError::InvalidState { .. }));
    stm.release_snapshot(snap);
}
