//! The scheduler façade: lifecycle, the transaction worker and the NB API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::descriptor::{
    DefaultMetadataMap, KVDescriptor, KVWithMetadata, KeySelector, KeyValuePair, MetadataMap,
};
use crate::error::{KvError, OpError};
use crate::exec::{execute_transaction, FailedKeys, LastErrors};
use crate::graph::Graph;
use crate::keyset::KeySet;
use crate::notify::{BaseValueStatus, WatchRegistry};
use crate::queue::{close_signal, TxnQueue};
use crate::refresh::refresh_graph;
use crate::registry::DescriptorRegistry;
use crate::txn::{
    KvForTxn, NbTransaction, PreProcessedTxn, QueuedTxn, RecordedTxn, ResyncType, RetryOps,
    TxnResult, TxnSource,
};
use crate::value::{Metadata, Value, ValueOrigin};

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Capacity of the transaction queue.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            queue_capacity: 100,
        }
    }
}

struct Inner {
    graph: Graph,
    registry: RwLock<DescriptorRegistry>,
    last_error: Mutex<LastErrors>,
    txn_seq: AtomicCell<u64>,
    queue: TxnQueue,
    closing: Receiver<()>,
    watchers: Mutex<WatchRegistry>,
    history: Mutex<Vec<RecordedTxn>>,
}

/// The key-value configuration scheduler.
///
/// Owns the graph, the descriptor registry and the transaction queue, and
/// runs one worker that executes queued transactions strictly one at a
/// time. Close (or drop) the scheduler to stop the worker; in-flight
/// descriptor operations run to completion.
pub struct KvScheduler {
    inner: Arc<Inner>,
    close_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KvScheduler {
    /// Starts a scheduler with the given configuration.
    pub fn start(config: SchedulerConfig) -> Self {
        let (close_tx, close_rx) = close_signal();
        let queue = TxnQueue::new(config.queue_capacity, close_rx.clone());
        let inner = Arc::new(Inner {
            graph: Graph::new(),
            registry: RwLock::new(DescriptorRegistry::new()),
            last_error: Mutex::new(LastErrors::default()),
            txn_seq: AtomicCell::new(0),
            queue,
            closing: close_rx,
            watchers: Mutex::new(WatchRegistry::default()),
            history: Mutex::new(Vec::new()),
        });
        let worker = {
            let inner = inner.clone();
            thread::spawn(move || worker_loop(&inner))
        };
        KvScheduler {
            inner,
            close_tx: Mutex::new(Some(close_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Registers a descriptor. Registration order defines key-selector
    /// priority.
    pub fn register_descriptor(&self, descriptor: KVDescriptor) {
        self.inner.registry.write().register(descriptor);
    }

    /// Commits an NB transaction and blocks until it has been executed.
    /// On a full queue the call waits for space (or for close).
    pub fn commit(&self, txn: NbTransaction) -> Result<TxnResult, KvError> {
        let (result_tx, result_rx) = bounded(1);
        self.inner.queue.enqueue(QueuedTxn::Nb {
            txn,
            result: Some(result_tx),
        })?;
        select! {
            recv(result_rx) -> result => result.map_err(|_| KvError::ClosedScheduler),
            recv(self.inner.closing) -> _ => Err(KvError::ClosedScheduler),
        }
    }

    /// Enqueues an NB transaction without waiting for its execution. Fails
    /// fast with [`KvError::TxnQueueFull`] on a full queue.
    pub fn commit_async(&self, txn: NbTransaction) -> Result<(), KvError> {
        self.inner.queue.enqueue(QueuedTxn::Nb { txn, result: None })
    }

    /// Enqueues a single-key SB notification: the southbound agent observed
    /// the given value (or its absence).
    pub fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) -> Result<(), KvError> {
        self.inner.queue.enqueue(QueuedTxn::Sb {
            key: key.into(),
            value,
            metadata,
        })
    }

    /// Subscribes a watcher: status transitions of base keys matching the
    /// filter are pushed to the sender, non-blocking.
    pub fn subscribe(&self, sender: Sender<BaseValueStatus>, filter: KeySelector) {
        self.inner.watchers.lock().subscribe(sender, filter);
    }

    /// Returns the current value stored for the key, if any.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner
            .graph
            .read()
            .get_node(key)
            .and_then(|node| node.value().cloned())
    }

    /// Returns all values whose keys match the selector.
    pub fn get_values(&self, selector: impl Fn(&str) -> bool) -> Vec<KVWithMetadata> {
        let reader = self.inner.graph.read();
        reader
            .nodes()
            .filter(|node| selector(node.key()))
            .filter_map(|node| {
                Some(KVWithMetadata {
                    key: node.key().to_string(),
                    value: node.value()?.clone(),
                    metadata: node.metadata().cloned(),
                    origin: node.origin(),
                })
            })
            .collect()
    }

    /// Returns the values that wait for an unsatisfied dependency.
    pub fn get_pending_values(&self) -> Vec<KeyValuePair> {
        let reader = self.inner.graph.read();
        reader
            .nodes()
            .filter(|node| node.is_pending())
            .filter_map(|node| {
                Some(KeyValuePair {
                    key: node.key().to_string(),
                    value: node.value()?.clone(),
                })
            })
            .collect()
    }

    /// Returns the base keys currently in a failed state, with the error
    /// propagated from the failed operation.
    pub fn get_failed_values(&self) -> Vec<(String, OpError)> {
        let reader = self.inner.graph.read();
        reader
            .nodes()
            .filter_map(|node| {
                let flag = node.flags().error.as_ref()?;
                Some((node.key().to_string(), flag.error.clone()))
            })
            .collect()
    }

    /// Builds the metadata map of a descriptor from the current graph:
    /// label -> metadata for every applied value the descriptor owns.
    /// Returns `None` for unknown descriptors and descriptors without
    /// metadata support.
    pub fn get_metadata_map(&self, descriptor: &str) -> Option<Box<dyn MetadataMap>> {
        let registry = self.inner.registry.read();
        let record = registry.get(descriptor)?;
        if !record.with_metadata {
            return None;
        }
        let mut map: Box<dyn MetadataMap> = match record.metadata_map_factory.as_ref() {
            Some(factory) => factory(),
            None => Box::new(DefaultMetadataMap::default()),
        };
        let reader = self.inner.graph.read();
        for node in reader.nodes() {
            if node.flags().descriptor.as_deref() != Some(descriptor) || node.is_derived() {
                continue;
            }
            if let Some(metadata) = node.metadata() {
                map.put(node.label(), metadata.clone());
            }
        }
        Some(map)
    }

    /// The recorded (compressed) op streams of all executed transactions,
    /// oldest first.
    pub fn transaction_history(&self) -> Vec<RecordedTxn> {
        self.inner.history.lock().clone()
    }

    /// Closes the scheduler: pending enqueues are unblocked with
    /// [`KvError::ClosedScheduler`], the worker and all retry timers stop.
    pub fn close(&self) {
        let close_tx = self.close_tx.lock().take();
        drop(close_tx);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for KvScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    while let Some(queued) = inner.queue.dequeue() {
        process_txn(inner, queued);
    }
    debug!("transaction worker stopped");
}

fn process_txn(inner: &Arc<Inner>, queued: QueuedTxn) {
    let registry = inner.registry.read();
    let seq_num = inner.txn_seq.fetch_add(1);

    let (txn, result_tx) = preprocess(inner, &registry, seq_num, queued);
    debug!(
        "executing txn #{} with {} value(s)",
        txn.seq_num,
        txn.values.len()
    );

    let dry_run = txn.is_downstream_resync();
    let (ops, failed) = {
        let mut last_error = inner.last_error.lock();
        execute_transaction(&inner.graph, &registry, &mut last_error, &txn, dry_run)
    };

    let retrying = schedule_retries(inner, &txn, &failed);
    let error = aggregate_error(seq_num, &ops, &failed);

    inner.history.lock().push(RecordedTxn {
        seq_num,
        description: txn.description.clone(),
        ops: ops.clone(),
    });
    if !dry_run {
        inner.watchers.lock().notify(&ops, &retrying);
    }

    if let Some(result_tx) = result_tx {
        let _ = result_tx.send(TxnResult { seq_num, error });
    }
}

/// Normalises a queued transaction into an ordered list of value items.
fn preprocess(
    inner: &Arc<Inner>,
    registry: &DescriptorRegistry,
    seq_num: u64,
    queued: QueuedTxn,
) -> (PreProcessedTxn, Option<Sender<TxnResult>>) {
    match queued {
        QueuedTxn::Nb { txn, result } => {
            let resync = txn.resync();
            if resync == ResyncType::Upstream || resync == ResyncType::Downstream {
                let mut writer = inner.graph.write(true);
                refresh_graph(&mut writer, registry, None, txn.verbose_refresh);
                writer.save();
            }
            let values = preprocess_nb_values(inner, &txn, resync);
            let pre = PreProcessedTxn {
                seq_num,
                source: TxnSource::Nb {
                    retry: txn.retry_policy(),
                    revert_on_failure: txn.revert_on_failure,
                    resync,
                },
                values,
                description: txn.description,
            };
            (pre, result)
        }
        QueuedTxn::Sb {
            key,
            value,
            metadata,
        } => {
            let pre = PreProcessedTxn {
                seq_num,
                source: TxnSource::Sb,
                values: vec![KvForTxn {
                    key,
                    value,
                    origin: ValueOrigin::FromSB,
                    metadata,
                    is_revert: false,
                }],
                description: String::from("SB notification"),
            };
            (pre, None)
        }
        QueuedTxn::Retry(retry) => {
            let values = preprocess_retry_values(inner, &retry);
            let pre = PreProcessedTxn {
                seq_num,
                source: TxnSource::Retry {
                    period: retry.period,
                },
                values,
                description: format!("retry of txn #{}", retry.txn_seq_num),
            };
            (pre, None)
        }
    }
}

fn preprocess_nb_values(
    inner: &Arc<Inner>,
    txn: &NbTransaction,
    resync: ResyncType,
) -> Vec<KvForTxn> {
    let mut values: Vec<KvForTxn> = txn
        .values
        .iter()
        .map(|(key, value)| KvForTxn {
            key: key.clone(),
            value: value.clone(),
            origin: ValueOrigin::FromNB,
            metadata: None,
            is_revert: false,
        })
        .collect();

    if resync == ResyncType::None {
        return values;
    }

    // a resync re-declares the full NB intent: every NB-owned base value not
    // re-asserted is deleted (full/upstream), or re-asserted from its last
    // declared revision (downstream simulation)
    let declared: KeySet = values.iter().map(|kv| kv.key.clone()).collect();
    let reader = inner.graph.read();
    let mut owned: KeySet = reader
        .keys_where(|node| {
            node.origin() == ValueOrigin::FromNB && !node.is_derived() && node.value().is_some()
        })
        .into_iter()
        .collect();
    owned.subtract(&declared);
    for key in owned.sorted() {
        let value = match resync {
            ResyncType::Downstream => reader
                .get_node(&key)
                .and_then(|node| node.flags().last_change.as_ref())
                .and_then(|lc| lc.value.clone()),
            _ => None,
        };
        values.push(KvForTxn {
            key,
            value,
            origin: ValueOrigin::FromNB,
            metadata: None,
            is_revert: false,
        });
    }
    values
}

/// Re-asserts the last declared value of every retried key whose last
/// change still stems from the transaction the retry was scheduled for;
/// superseded retries contribute nothing.
fn preprocess_retry_values(inner: &Arc<Inner>, retry: &RetryOps) -> Vec<KvForTxn> {
    let reader = inner.graph.read();
    let mut values = Vec::new();
    for key in retry.keys.sorted() {
        let last_change = match reader
            .get_node(&key)
            .and_then(|node| node.flags().last_change.clone())
        {
            Some(last_change) => last_change,
            None => continue,
        };
        if last_change.txn_seq_num != retry.txn_seq_num {
            debug!("dropping stale retry of {}", key);
            continue;
        }
        values.push(KvForTxn {
            key,
            value: last_change.value.clone(),
            origin: last_change.origin,
            metadata: None,
            is_revert: false,
        });
    }
    values
}

/// Schedules retries for the retriable failed base keys whose last change
/// enabled them. Returns the keys a retry was scheduled for.
fn schedule_retries(inner: &Arc<Inner>, txn: &PreProcessedTxn, failed: &FailedKeys) -> KeySet {
    let mut retrying = KeySet::new();
    let mut groups: BTreeMap<Duration, KeySet> = BTreeMap::new();
    {
        let reader = inner.graph.read();
        let mut keys: Vec<&String> = failed
            .iter()
            .filter(|(_, retriable)| **retriable)
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        for key in keys {
            let retry = match reader
                .get_node(key)
                .and_then(|node| node.flags().last_change.as_ref())
                .map(|lc| lc.retry.clone())
            {
                Some(retry) => retry,
                None => continue,
            };
            if !retry.enabled {
                continue;
            }
            let period = match &txn.source {
                TxnSource::Retry { period } if retry.exp_backoff => *period * 2,
                _ => retry.period,
            };
            groups.entry(period).or_default().add(key.clone());
            retrying.add(key.clone());
        }
    }
    for (period, keys) in groups {
        inner.queue.enqueue_retry(RetryOps {
            txn_seq_num: txn.seq_num,
            keys,
            period,
        });
    }
    retrying
}

/// Folds the per-key failures of a transaction into the caller-visible
/// error. A value whose failure was reverted away still fails the
/// transaction; its revert just restored the previous state.
fn aggregate_error(
    seq_num: u64,
    ops: &[crate::txn::RecordedTxnOp],
    failed: &FailedKeys,
) -> Option<KvError> {
    let mut failures: BTreeMap<String, (String, bool)> = BTreeMap::new();
    for op in ops {
        if let Some(err) = &op.new_err {
            let retriable = failed.get(&op.key).copied().unwrap_or(false);
            failures.insert(op.key.clone(), (err.to_string(), retriable));
        }
    }
    for (key, retriable) in failed {
        failures
            .entry(key.clone())
            .or_insert_with(|| (String::from("unknown error"), *retriable));
    }
    if failures.is_empty() {
        return None;
    }
    let failures = failures
        .into_iter()
        .map(|(key, (error, retriable))| (key, error, retriable))
        .collect();
    Some(KvError::TransactionFailed { seq_num, failures })
}
