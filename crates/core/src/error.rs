//! Error types for the transactional memory engine
//!
//! Aborts are ordinary control flow: a transaction that loses a conflict
//! surfaces [`StmError::Aborted`] and the caller retries.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::fmt;
use thiserror::Error;

/// Result type alias for engine operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Why a transaction aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A write-set lock could not be acquired
    LockFailed,
    /// A read-set entry failed validation at commit
    ValidationFailed,
    /// An operation observed a conflicting concurrent write mid-transaction
    Conflict(&'static str),
    /// The caller requested the abort
    User,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::LockFailed => write!(f, "lock failed"),
            AbortReason::ValidationFailed => write!(f, "validation failed"),
            AbortReason::Conflict(what) => write!(f, "conflict: {}", what),
            AbortReason::User => write!(f, "user abort"),
        }
    }
}

/// Error types for the engine
#[derive(Debug, Error)]
pub enum StmError {
    /// Transaction aborted; safe to retry
    #[error("Transaction aborted: {reason}")]
    Aborted {
        /// Cause of the abort
        reason: AbortReason,
    },

    /// Retry loop gave up
    #[error("Transaction retry limit exceeded after {attempts} attempts (last: {last_reason})")]
    RetryLimitExceeded {
        /// Attempts made
        attempts: usize,
        /// Reason of the final abort
        last_reason: AbortReason,
    },

    /// Operation not allowed in the current transaction state
    #[error("Invalid transaction state: {state}")]
    InvalidState {
        /// Description of the offending state
        state: String,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StmError {
    /// Build an abort error
    pub fn aborted(reason: AbortReason) -> Self {
        StmError::Aborted { reason }
    }

    /// Abort raised by an operation that detected a conflicting writer
    pub fn conflict(what: &'static str) -> Self {
        StmError::Aborted {
            reason: AbortReason::Conflict(what),
        }
    }

    /// True if the error is a transient conflict worth retrying
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StmError::Aborted {
                reason: AbortReason::LockFailed
                    | AbortReason::ValidationFailed
                    | AbortReason::Conflict(_)
            }
        )
    }

    /// Abort reason, if this is an abort
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            StmError::Aborted { reason } => Some(reason),
            _ => None,
        }
    }
}
