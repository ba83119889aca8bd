//! Transaction types: queued inputs, preprocessed items and recorded ops.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::KvError;
use crate::graph::RetryPolicy;
use crate::keyset::KeySet;
use crate::value::{Metadata, Value, ValueOrigin};

/// The four operations the executor dispatches to descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnOperation {
    /// Create a value that previously did not exist or was pending.
    Add,
    /// Change an existing applied value.
    Modify,
    /// Remove a value (or park it as pending).
    Delete,
    /// Re-evaluate a value because one of its dependencies changed.
    Update,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnOperation::Add => "ADD",
            TxnOperation::Modify => "MODIFY",
            TxnOperation::Delete => "DELETE",
            TxnOperation::Update => "UPDATE",
        };
        f.write_str(name)
    }
}

/// How an NB transaction rebases against the current graph state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResyncType {
    /// No resync: apply only the keys present in the transaction.
    None,
    /// Re-declare the full NB intent: keys not re-asserted are deleted.
    Full,
    /// Like `Full`, but refresh the graph from SB first.
    Upstream,
    /// Refresh the graph from SB only; the NB diff is simulated (dry-run)
    /// without being applied.
    Downstream,
}

/// A northbound transaction: a batch of value assertions plus options.
#[derive(Clone, Debug, Default)]
pub struct NbTransaction {
    pub(crate) values: Vec<(String, Option<Value>)>,
    pub(crate) resync_type: Option<ResyncType>,
    pub(crate) verbose_refresh: bool,
    pub(crate) retry_failed: bool,
    pub(crate) retry_period: Duration,
    pub(crate) exp_backoff_retry: bool,
    pub(crate) revert_on_failure: bool,
    pub(crate) description: String,
}

impl NbTransaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts a value for a key.
    pub fn set_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.push((key.into(), Some(value)));
        self
    }

    /// Asserts the absence of a key.
    pub fn delete_value(mut self, key: impl Into<String>) -> Self {
        self.values.push((key.into(), None));
        self
    }

    /// Selects the resync mode of the transaction.
    pub fn with_resync(mut self, resync: ResyncType) -> Self {
        self.resync_type = Some(resync);
        self
    }

    /// Logs dumped SB state at info level during refresh.
    pub fn with_verbose_refresh(mut self) -> Self {
        self.verbose_refresh = true;
        self
    }

    /// Schedules retries for retriable failures, starting after `period`.
    pub fn with_retry(mut self, period: Duration, exp_backoff: bool) -> Self {
        self.retry_failed = true;
        self.retry_period = period;
        self.exp_backoff_retry = exp_backoff;
        self
    }

    /// Reverts all already-applied values when any value fails.
    pub fn with_revert_on_failure(mut self) -> Self {
        self.revert_on_failure = true;
        self
    }

    /// Attaches a human-readable description (shown in history and logs).
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub(crate) fn resync(&self) -> ResyncType {
        self.resync_type.unwrap_or(ResyncType::None)
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry_failed,
            period: self.retry_period,
            exp_backoff: self.exp_backoff_retry,
        }
    }
}

/// Result of an executed transaction, delivered to blocking committers.
#[derive(Clone, Debug)]
pub struct TxnResult {
    /// Sequence number assigned to the transaction.
    pub seq_num: u64,
    /// `None` iff no value remained in a failed state after any revert.
    pub error: Option<KvError>,
}

/// Retry of previously failed operations.
#[derive(Clone, Debug)]
pub(crate) struct RetryOps {
    /// Sequence number of the transaction whose failures are retried.
    pub txn_seq_num: u64,
    /// The failed base keys.
    pub keys: KeySet,
    /// Delay that preceded this retry.
    pub period: Duration,
}

/// A transaction waiting in the queue.
pub(crate) enum QueuedTxn {
    Nb {
        txn: NbTransaction,
        result: Option<Sender<TxnResult>>,
    },
    Sb {
        key: String,
        value: Option<Value>,
        metadata: Option<Metadata>,
    },
    Retry(RetryOps),
}

impl QueuedTxn {
    pub(crate) fn is_blocking_nb(&self) -> bool {
        matches!(
            self,
            QueuedTxn::Nb {
                result: Some(_),
                ..
            }
        )
    }
}

/// Where a preprocessed transaction came from, with the attributes the
/// executor needs for flag stamping and post-processing.
#[derive(Clone, Debug)]
pub(crate) enum TxnSource {
    Nb {
        retry: RetryPolicy,
        revert_on_failure: bool,
        resync: ResyncType,
    },
    Sb,
    Retry {
        period: Duration,
    },
}

/// One normalised (key, value, origin, metadata) item of a transaction.
#[derive(Clone, Debug)]
pub(crate) struct KvForTxn {
    pub key: String,
    pub value: Option<Value>,
    pub origin: ValueOrigin,
    pub metadata: Option<Metadata>,
    pub is_revert: bool,
}

/// A queued transaction normalised for execution.
#[derive(Debug)]
pub(crate) struct PreProcessedTxn {
    pub seq_num: u64,
    pub source: TxnSource,
    pub values: Vec<KvForTxn>,
    pub description: String,
}

impl PreProcessedTxn {
    pub(crate) fn is_retry(&self) -> bool {
        matches!(self.source, TxnSource::Retry { .. })
    }

    pub(crate) fn revert_on_failure(&self) -> bool {
        matches!(
            self.source,
            TxnSource::Nb {
                revert_on_failure: true,
                ..
            }
        )
    }

    pub(crate) fn is_downstream_resync(&self) -> bool {
        matches!(
            self.source,
            TxnSource::Nb {
                resync: ResyncType::Downstream,
                ..
            }
        )
    }
}

/// Record of one executed operation; the per-transaction stream of these is
/// the scheduler's observable output.
#[derive(Clone, Debug)]
pub struct RecordedTxnOp {
    /// Key the operation was executed on.
    pub key: String,
    /// Which operation it was.
    pub operation: TxnOperation,
    /// Value before the operation.
    pub prev_value: Option<Value>,
    /// Value after the operation.
    pub new_value: Option<Value>,
    /// Origin before the operation.
    pub prev_origin: ValueOrigin,
    /// Origin after the operation.
    pub new_origin: ValueOrigin,
    /// Error state of the key before the operation.
    pub prev_err: Option<crate::error::OpError>,
    /// Error produced by the operation, if any.
    pub new_err: Option<crate::error::OpError>,
    /// Whether the value was pending before the operation.
    pub was_pending: bool,
    /// Whether the value is pending after the operation.
    pub is_pending: bool,
    /// Whether the operation targeted a derived value.
    pub is_derived: bool,
    /// Whether the operation was part of a revert.
    pub is_revert: bool,
}

/// An executed transaction as kept in the history: its compressed op stream
/// plus identification.
#[derive(Clone, Debug)]
pub struct RecordedTxn {
    /// Sequence number of the transaction.
    pub seq_num: u64,
    /// Description supplied by the NB caller (empty otherwise).
    pub description: String,
    /// The compressed op stream.
    pub ops: Vec<RecordedTxnOp>,
}
