//! STM Comprehensive Test Suite
//!
//! End-to-end tests through the public facade: engine, participants and
//! snapshots together.
//!
//! ## Test Tier Structure
//!
//! - **Tier 1: Core Invariants** (fast, must pass)
//!   Atomicity, no lost update, version monotonicity, history ordering.
//!
//! - **Tier 2: Behavioral Scenarios**
//!   Snapshot stability, deferred unlink, abort-then-retry idempotence,
//!   configuration loading.
//!
//! - **Tier 3: Stress** (opt-in with #[ignore], slow)
//!
//! ## Running Tests
//!
//! ```bash
//! # Tier 1 + Tier 2
//! cargo test --test stm_comprehensive
//!
//! # stress tests
//! cargo test --test stm_comprehensive stress -- --ignored
//! ```

mod test_utils;

// Tier 1: Core Invariants
mod invariant_tests;

// Tier 2: Behavioral Scenarios
mod config_tests;
mod retry_tests;
mod snapshot_tests;

// Tier 3: Stress (use #[ignore])
mod stress_tests;
