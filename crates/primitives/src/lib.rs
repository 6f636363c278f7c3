//! Transactional data structures for the Strata STM
//!
//! Every structure here is a [`TObject`](strata_concurrency::TObject)
//! participant: operations take an explicit `&mut Transaction`, record what
//! they read and buffer what they write, and the engine's commit protocol
//! makes the result atomic.
//!
//! - **TSortedList**: sorted map with phantom-safe scans and snapshot reads
//! - **TBox**: one value under optimistic concurrency control
//! - **MvBox**: one value with multi-version history
//!
//! ## Cross-Structure Transactions
//!
//! ```rust,ignore
//! let stm = Stm::in_memory();
//! let index = TSortedList::new(&stm);
//! let total = TBox::new(0u64);
//!
//! stm.atomically(|txn| {
//!     if index.trans_insert(txn, 42, "answer")? {
//!         total.modify(txn, |t| t + 1)?;
//!     }
//!     Ok(())
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mvbox;
pub mod sorted_list;
pub mod tbox;

pub use mvbox::MvBox;
pub use sorted_list::TSortedList;
pub use tbox::TBox;

use strata_concurrency::Transaction;
use strata_core::{StmError, StmResult, INVALID_SNAPSHOT};

/// Reject writes from inactive or snapshot-scoped transactions
pub(crate) fn ensure_writable(txn: &Transaction) -> StmResult<()> {
    txn.ensure_active()?;
    if txn.active_sid() != INVALID_SNAPSHOT {
        return Err(StmError::InvalidState {
            state: format!(
                "transaction {} reads snapshot {} and cannot write",
                txn.txn_id(),
                txn.active_sid()
            ),
        });
    }
    Ok(())
}
