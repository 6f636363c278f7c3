//! Configuration tests (Tier 2)
//!
//! Engines built from TOML files behave as configured.

use std::time::{Duration, Instant};
use strata_stm::{RetryConfig, Stm, StmConfig, StmError, TSortedList, CONFIG_FILE_NAME};
use tempfile::TempDir;

#[test]
fn engine_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        r#"
max_threads = 8

[retry]
max_retries = 3
base_delay_ms = 0
max_delay_ms = 0
"#,
    )
    .unwrap();

    let config = StmConfig::from_file(&path).unwrap();
    assert_eq!(config.max_threads, 8);
    assert_eq!(
        config.retry,
        RetryConfig::new()
            .with_max_retries(3)
            .with_base_delay_ms(0)
            .with_max_delay_ms(0)
    );

    let stm = Stm::new(config).unwrap();
    let err = stm
        .atomically(|txn| -> Result<(), StmError> {
            Err(txn.abort(strata_stm::AbortReason::LockFailed))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        StmError::RetryLimitExceeded { attempts: 4, .. }
    ));
}

#[test]
fn invalid_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "max_threads = 500\n").unwrap();

    let err = StmConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, StmError::Config(_)));
    assert!(err.to_string().contains(CONFIG_FILE_NAME));
}

#[test]
fn background_maintenance_compacts_without_manual_passes() {
    let config = StmConfig {
        background_maintenance: true,
        maintenance_interval_ms: 5,
        ..StmConfig::default()
    };
    let stm = Stm::new(config).unwrap();
    assert!(stm.is_maintenance_running());

    let list: std::sync::Arc<TSortedList<u64, u64>> = TSortedList::new(&stm);
    list.nontrans_insert(1, 1);
    {
        let _snap = stm.take_snapshot();
        stm.transaction(|txn| list.trans_erase(txn, &1)).unwrap();
        assert_eq!(list.node_count(), 1);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while list.node_count() != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(list.node_count(), 0);

    assert!(stm.stop_maintenance());
    assert!(!stm.is_maintenance_running());
}
