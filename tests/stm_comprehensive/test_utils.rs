//! Test utilities for the STM comprehensive tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread::{self, JoinHandle};
use strata_stm::{RetryConfig, Stm, StmConfig, TSortedList};

/// Global counter for unique key generation
static KEY_COUNTER: AtomicU64 = AtomicU64::new(1_000_000);

static TRACING: Once = Once::new();

/// Route engine logs to the test writer; filter with `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Generate a key no other test uses
pub fn unique_key() -> u64 {
    KEY_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Engine with a retry budget sized for heavily contended tests
pub fn contended_stm() -> Arc<Stm> {
    init_tracing();
    let config = StmConfig {
        retry: RetryConfig::new()
            .with_max_retries(10_000)
            .with_base_delay_ms(0)
            .with_max_delay_ms(1),
        ..StmConfig::default()
    };
    Stm::new(config).expect("valid config")
}

/// Engine plus one registered list
pub fn stm_with_list() -> (Arc<Stm>, Arc<TSortedList<u64, u64>>) {
    let stm = contended_stm();
    let list = TSortedList::new(&stm);
    (stm, list)
}

/// Run threads that start at the same time, sharing `shared`
pub fn run_with_shared<S, F, T>(num_threads: usize, shared: S, f: F) -> Vec<T>
where
    S: Send + Sync + 'static,
    F: Fn(usize, &S) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let barrier = Arc::new(Barrier::new(num_threads));
    let shared = Arc::new(shared);
    let f = Arc::new(f);

    let handles: Vec<JoinHandle<T>> = (0..num_threads)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let shared = Arc::clone(&shared);
            let f = Arc::clone(&f);
            thread::spawn(move || {
                barrier.wait();
                f(i, &shared)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .collect()
}
