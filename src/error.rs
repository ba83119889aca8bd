//! Errors surfaced by the scheduler.

use std::sync::Arc;

use thiserror::Error;

/// Error returned by a single descriptor operation. Kept opaque: the core
/// records and propagates it but never inspects it beyond the descriptor's
/// own retriability verdict.
pub type OpError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned to northbound callers.
#[derive(Clone, Debug, Error)]
pub enum KvError {
    /// The scheduler has been closed; no further transactions are accepted.
    #[error("scheduler is closed")]
    ClosedScheduler,

    /// The transaction queue is full and the commit was non-blocking.
    #[error("transaction queue is full")]
    TxnQueueFull,

    /// A value did not have the concrete type its descriptor expects.
    #[error("value for key {key} has unexpected type (expected {expected})")]
    InvalidValueType {
        /// Key under which the mismatched value was submitted.
        key: String,
        /// Type name the descriptor expects.
        expected: &'static str,
    },

    /// Metadata stored for a key did not have the expected concrete type.
    #[error("metadata for key {key} has unexpected type")]
    InvalidMetadataType {
        /// Key whose metadata was mismatched.
        key: String,
    },

    /// One or more values of the transaction ended up in a failed state.
    #[error("transaction #{seq_num} failed for {} key(s)", failures.len())]
    TransactionFailed {
        /// Sequence number of the failed transaction.
        seq_num: u64,
        /// Per-key failures: `(key, error, retriable)`.
        failures: Vec<(String, String, bool)>,
    },
}

impl KvError {
    /// Wraps this error into the opaque per-operation error handle.
    pub fn into_op_error(self) -> OpError {
        Arc::new(self)
    }
}
