//! Bounded FIFO of queued transactions, plus retry delay timers.

use std::thread;

use crossbeam_channel::{after, bounded, select, Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, warn};

use crate::error::KvError;
use crate::txn::{QueuedTxn, RetryOps};

/// The transaction queue. A blocking NB commit waits on a full queue until
/// space appears or the scheduler closes; every other producer fails fast
/// with [`KvError::TxnQueueFull`].
#[derive(Clone)]
pub(crate) struct TxnQueue {
    tx: Sender<QueuedTxn>,
    rx: Receiver<QueuedTxn>,
    closing: Receiver<()>,
}

impl TxnQueue {
    /// Creates a queue of fixed capacity. `closing` is a channel that never
    /// carries a message; its disconnection is the close signal.
    pub(crate) fn new(capacity: usize, closing: Receiver<()>) -> Self {
        let (tx, rx) = bounded(capacity);
        TxnQueue { tx, rx, closing }
    }

    /// Adds a transaction to the queue.
    pub(crate) fn enqueue(&self, txn: QueuedTxn) -> Result<(), KvError> {
        if txn.is_blocking_nb() {
            select! {
                recv(self.closing) -> _ => Err(KvError::ClosedScheduler),
                send(self.tx, txn) -> res => res.map_err(|_| KvError::ClosedScheduler),
            }
        } else {
            if let Err(TryRecvError::Disconnected) = self.closing.try_recv() {
                return Err(KvError::ClosedScheduler);
            }
            match self.tx.try_send(txn) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(KvError::TxnQueueFull),
                Err(TrySendError::Disconnected(_)) => Err(KvError::ClosedScheduler),
            }
        }
    }

    /// Pulls the oldest queued transaction; `None` once the scheduler is
    /// closing.
    pub(crate) fn dequeue(&self) -> Option<QueuedTxn> {
        select! {
            recv(self.closing) -> _ => None,
            recv(self.rx) -> txn => txn.ok(),
        }
    }

    /// Postpones a retry until its period has elapsed, then enqueues it.
    /// A full queue re-arms the timer with the same period; close aborts.
    pub(crate) fn enqueue_retry(&self, retry: RetryOps) {
        let queue = self.clone();
        thread::spawn(move || {
            let mut delay = retry.period;
            loop {
                select! {
                    recv(queue.closing) -> _ => return,
                    recv(after(delay)) -> _ => {}
                }
                debug!(
                    "retrying {} key(s) failed by txn #{}",
                    retry.keys.len(),
                    retry.txn_seq_num
                );
                match queue.enqueue(QueuedTxn::Retry(retry.clone())) {
                    Ok(()) => return,
                    Err(KvError::TxnQueueFull) => {
                        warn!(
                            "failed to enqueue retry for txn #{}: queue full",
                            retry.txn_seq_num
                        );
                        delay = retry.period;
                    }
                    Err(_) => return,
                }
            }
        });
    }
}

/// Creates the close signal: dropping the returned sender wakes every
/// blocked producer and the consumer.
pub(crate) fn close_signal() -> (Sender<()>, Receiver<()>) {
    bounded(0)
}
