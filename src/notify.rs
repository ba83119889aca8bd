//! Fan-out of per-base-key status transitions to subscribed watchers.

use crossbeam_channel::{Sender, TrySendError};
use log::warn;
use rustc_hash::FxHashMap;

use crate::descriptor::KeySelector;
use crate::error::OpError;
use crate::keyset::KeySet;
use crate::txn::RecordedTxnOp;

/// Visible state of a base value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueState {
    /// The key is not declared and not configured.
    Nonexistent,
    /// The value is declared but waits for an unsatisfied dependency.
    Pending,
    /// The value is applied southbound.
    Configured,
    /// The last operation on the value failed and no retry is scheduled.
    Failed,
    /// The last operation on the value failed and a retry is scheduled.
    Retrying,
}

/// Status transition of one base key, delivered to watchers after every
/// transaction that changed the key's visible state.
#[derive(Clone, Debug)]
pub struct BaseValueStatus {
    /// The base key.
    pub key: String,
    /// State before the transaction.
    pub old_state: ValueState,
    /// State after the transaction.
    pub new_state: ValueState,
    /// Error of the failed operation, when the new state is Failed or
    /// Retrying.
    pub error: Option<OpError>,
}

struct Subscription {
    sender: Sender<BaseValueStatus>,
    filter: KeySelector,
}

/// Holds watcher subscriptions and pushes status transitions to them.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    subscriptions: Vec<Subscription>,
}

impl WatchRegistry {
    pub(crate) fn subscribe(&mut self, sender: Sender<BaseValueStatus>, filter: KeySelector) {
        self.subscriptions.push(Subscription { sender, filter });
    }

    /// Derives per-base-key transitions from a compressed op stream and
    /// pushes them to matching subscribers. Sends never block; a full
    /// channel drops the notification with a warning.
    pub(crate) fn notify(&mut self, ops: &[RecordedTxnOp], retrying: &KeySet) {
        for status in transitions(ops, retrying) {
            self.subscriptions.retain(|subscription| {
                if !(subscription.filter)(&status.key) {
                    return true;
                }
                match subscription.sender.try_send(status.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "watcher channel full, dropping status of {}",
                            status.key
                        );
                        true
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                }
            });
        }
    }
}

/// Folds a compressed op stream into one transition per base key: the first
/// record provides the pre-transaction state, the last one the final state.
fn transitions(ops: &[RecordedTxnOp], retrying: &KeySet) -> Vec<BaseValueStatus> {
    let mut order: Vec<String> = Vec::new();
    let mut first_last: FxHashMap<String, (usize, usize)> = FxHashMap::default();
    for (index, op) in ops.iter().enumerate() {
        if op.is_derived {
            continue;
        }
        match first_last.get_mut(&op.key) {
            Some((_, last)) => *last = index,
            None => {
                order.push(op.key.clone());
                first_last.insert(op.key.clone(), (index, index));
            }
        }
    }

    let mut statuses = Vec::new();
    for key in order {
        let (first, last) = first_last[&key];
        let (first, last) = (&ops[first], &ops[last]);
        let old_state = state_of(
            first.prev_value.is_some(),
            first.was_pending,
            first.prev_err.is_some(),
            false,
        );
        let new_state = state_of(
            last.new_value.is_some() || last.is_pending,
            last.is_pending,
            last.new_err.is_some(),
            retrying.has(&key),
        );
        if old_state == new_state {
            continue;
        }
        statuses.push(BaseValueStatus {
            key,
            old_state,
            new_state,
            error: last.new_err.clone(),
        });
    }
    statuses
}

fn state_of(exists: bool, pending: bool, failed: bool, retrying: bool) -> ValueState {
    if !exists && !failed {
        ValueState::Nonexistent
    } else if failed {
        if retrying {
            ValueState::Retrying
        } else {
            ValueState::Failed
        }
    } else if pending {
        ValueState::Pending
    } else {
        ValueState::Configured
    }
}
