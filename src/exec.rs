//! Transaction execution: the recursive `apply_value` over the graph.
//!
//! A preprocessed transaction is applied value by value. Each application
//! resolves to one of four operations (Add / Modify / Delete / Update) and
//! may cascade: dependents are re-evaluated through Update, derived values
//! are (re-)applied as children of their base. A per-transaction branch set
//! guards against dependency/derivation cycles, and a failed-keys map plus
//! the per-key last-error store capture partial failures for retry
//! scheduling and status reporting.

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::error::OpError;
use crate::graph::{construct_targets, ErrorFlag, Graph, GraphWriter, LastChangeFlag, RetryPolicy};
use crate::handler::DescriptorHandler;
use crate::keyset::KeySet;
use crate::registry::DescriptorRegistry;
use crate::txn::{KvForTxn, PreProcessedTxn, RecordedTxnOp, TxnOperation, TxnSource};
use crate::value::{Value, ValueOrigin};

/// Per-key error of the most recent executed operation. Distinct from the
/// node's error flag, which carries errors propagated from derived values
/// down to the base.
pub(crate) type LastErrors = FxHashMap<String, Option<OpError>>;

/// Base keys that ended up failed in a transaction; the value records
/// whether a retry may still succeed. Once a key is observed as
/// non-retriable it stays non-retriable for the transaction.
pub(crate) type FailedKeys = FxHashMap<String, bool>;

struct ApplyCtx<'a> {
    registry: &'a DescriptorRegistry,
    txn: &'a PreProcessedTxn,
    dry_run: bool,
    last_error: &'a mut LastErrors,
    failed: FailedKeys,
    branch: KeySet,
}

impl<'a> ApplyCtx<'a> {
    fn add_failed(&mut self, key: String, retriable: bool) {
        let prev_retriable = self.failed.get(&key).copied();
        let folded = retriable && prev_retriable.unwrap_or(true);
        self.failed.insert(key, folded);
    }

    fn last_error(&self, key: &str) -> Option<OpError> {
        self.last_error.get(key).cloned().flatten()
    }

    fn set_last_error(&mut self, key: &str, err: Option<OpError>) {
        self.last_error.insert(key.to_string(), err);
    }
}

/// Value recorded for a potential revert of the transaction.
struct PrevValue {
    key: String,
    value: Option<Value>,
}

/// Executes a preprocessed transaction. With `dry_run` the descriptor
/// operations are skipped, the graph overlay is discarded and the last-error
/// store is restored on exit; the returned op stream reports what would have
/// been executed.
pub(crate) fn execute_transaction(
    graph: &Graph,
    registry: &DescriptorRegistry,
    last_error: &mut LastErrors,
    txn: &PreProcessedTxn,
    dry_run: bool,
) -> (Vec<RecordedTxnOp>, FailedKeys) {
    let persist = !dry_run && !txn.is_downstream_resync();
    let mut graph_w = graph.write(persist);

    let saved_last_error = if dry_run { Some(last_error.clone()) } else { None };

    let mut ctx = ApplyCtx {
        registry,
        txn,
        dry_run,
        last_error,
        failed: FailedKeys::default(),
        branch: KeySet::new(),
    };

    let mut executed: Vec<RecordedTxnOp> = Vec::new();
    let mut prev_values: Vec<PrevValue> = Vec::new();
    let mut revert = false;

    for kv in &txn.values {
        let (ops, prev, err) = apply_value(&mut ctx, &mut graph_w, kv, false, false);
        executed.extend(ops);
        prev_values.push(prev);
        if err.is_some() && txn.revert_on_failure() {
            // the failed value is refreshed from SB and reverted; do not
            // retry it unless the revert fails too
            ctx.failed.remove(&kv.key);
            crate::refresh::refresh_graph(
                &mut graph_w,
                registry,
                Some(&KeySet::singleton(kv.key.clone())),
                false,
            );
            graph_w.save();
            revert = true;
            break;
        }
    }

    if revert {
        // record graph state in-between failure and revert
        drop(graph_w);
        graph_w = graph.write(true);

        // revert back to previous values, newest first
        for prev in prev_values.iter().rev() {
            let kv = KvForTxn {
                key: prev.key.clone(),
                value: prev.value.clone(),
                origin: ValueOrigin::FromNB,
                metadata: None,
                is_revert: true,
            };
            let (ops, _, _) = apply_value(&mut ctx, &mut graph_w, &kv, false, false);
            executed.extend(ops);
        }
    }

    let executed = compress_txn_ops(executed);

    let failed = ctx.failed;
    if let Some(saved) = saved_last_error {
        *last_error = saved;
    }
    drop(graph_w);
    (executed, failed)
}

/// Applies one value received from NB or SB, recursing into dependents and
/// derived values. Returns the executed ops, the previous value (for the
/// rollback stack) and the error of this application, if any.
fn apply_value(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    is_update: bool,
    is_derived: bool,
) -> (Vec<RecordedTxnOp>, PrevValue, Option<OpError>) {
    // dependency cycle detection
    if ctx.branch.has(&kv.key) {
        let prev = PrevValue {
            key: kv.key.clone(),
            value: None,
        };
        return (Vec::new(), prev, None);
    }
    ctx.branch.add(kv.key.clone());
    let result = apply_value_guarded(ctx, graph, kv, is_update, is_derived);
    ctx.branch.del(&kv.key);
    result
}

fn apply_value_guarded(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    is_update: bool,
    is_derived: bool,
) -> (Vec<RecordedTxnOp>, PrevValue, Option<OpError>) {
    let seq_num = ctx.txn.seq_num;

    // create new revision of the node and remember the previous value
    let prev_update_seq;
    let prev;
    {
        let node = graph.set_node(&kv.key);
        prev = PrevValue {
            key: node.key().to_string(),
            value: node.value().cloned(),
        };
        prev_update_seq = node.flags().last_update;

        if !is_update {
            // with Update it is not yet certain whether anything needs to
            // change, so apply_update refreshes the flag itself
            node.flags_mut().last_update = Some(seq_num);
            if !is_derived {
                let retry = match &ctx.txn.source {
                    TxnSource::Nb { retry, .. } => retry.clone(),
                    TxnSource::Retry { .. } => node
                        .flags()
                        .last_change
                        .as_ref()
                        .map(|lc| lc.retry.clone())
                        .unwrap_or_else(RetryPolicy::default),
                    TxnSource::Sb => RetryPolicy::default(),
                };
                node.flags_mut().last_change = Some(LastChangeFlag {
                    txn_seq_num: seq_num,
                    value: kv.value.clone(),
                    origin: kv.origin,
                    revert: kv.is_revert,
                    retry,
                });
            } else {
                node.flags_mut().derived = true;
            }
            node.flags_mut().origin = kv.origin;
        }
    }

    // if the value was already broken by this same transaction, do not try
    // again, unless this is a revert
    let prev_err = ctx.last_error(&kv.key);
    if !kv.is_revert && prev_err.is_some() && prev_update_seq == Some(seq_num) {
        return (Vec::new(), prev, prev_err);
    }

    let mut txn_op = pre_record_txn_op(ctx, graph, kv, is_derived);

    // determine the operation type
    let (node_has_value, node_pending) = {
        let node = graph.set_node(&kv.key);
        (node.value().is_some(), node.is_pending())
    };
    let operation = if is_update {
        TxnOperation::Update // triggered from within recursive applications
    } else if kv.value.is_none() {
        TxnOperation::Delete
    } else if !node_has_value || node_pending {
        TxnOperation::Add
    } else {
        TxnOperation::Modify
    };
    txn_op.operation = operation;

    debug!("txn #{}: {} {}", seq_num, operation, kv.key);

    let (executed, err) = match operation {
        TxnOperation::Delete => apply_delete(ctx, graph, kv, txn_op, false),
        TxnOperation::Add => apply_add(ctx, graph, kv, txn_op),
        TxnOperation::Modify => apply_modify(ctx, graph, kv, txn_op),
        TxnOperation::Update => apply_update(ctx, graph, kv, txn_op),
    };
    (executed, prev, err)
}

/// Adds a value which previously did not exist or was pending.
fn apply_add(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    mut txn_op: RecordedTxnOp,
) -> (Vec<RecordedTxnOp>, Option<OpError>) {
    let new_value = match kv.value.clone() {
        Some(value) => value,
        None => return apply_delete(ctx, graph, kv, txn_op, false),
    };
    graph.set_node(&kv.key).set_value(Some(new_value.clone()));

    let handler = DescriptorHandler::new(ctx.registry.descriptor_for_key(&kv.key));
    if let Some(descriptor) = handler.descriptor() {
        let label = handler.key_label(&kv.key);
        let node = graph.set_node(&kv.key);
        node.flags_mut().descriptor = Some(descriptor.name.clone());
        node.set_label(label);
    }

    // build relations with other targets
    let derives = handler.derived_values(&kv.key, &new_value);
    let dependencies = handler.dependencies(&kv.key, &new_value);
    let targets = construct_targets(dependencies, derives.iter().map(|d| d.key.as_str()));
    graph.set_node(&kv.key).set_targets(targets);

    if !graph.is_ready(&kv.key) {
        // not ready, wait for the missing dependency
        let node = graph.set_node(&kv.key);
        node.flags_mut().pending = true;
        node.flags_mut().error = None;
        txn_op.is_pending = true;
        ctx.set_last_error(&kv.key, None);
        save_unless_dry_run(ctx, graph);
        return (vec![txn_op], None);
    }

    // execute add operation
    if !ctx.dry_run && handler.descriptor().is_some() {
        let result = if kv.origin != ValueOrigin::FromSB {
            handler.add(&kv.key, &new_value)
        } else {
            // already added in SB
            Ok(kv.metadata.clone())
        };
        match result {
            Ok(metadata) => {
                ctx.set_last_error(&kv.key, None);
                set_metadata_if_supported(graph, &handler, &kv.key, metadata);
            }
            Err(err) => {
                ctx.set_last_error(&kv.key, Some(err.clone()));
                let base = graph.base_key(&kv.key);
                ctx.add_failed(base, handler.is_retriable_failure(&err));
                propagate_error(graph, &kv.key, err.clone(), TxnOperation::Add);
                // add failed => keep value pending
                let node = graph.set_node(&kv.key);
                node.flags_mut().pending = true;
                txn_op.is_pending = true;
                txn_op.new_err = Some(err.clone());
                save_unless_dry_run(ctx, graph);
                return (vec![txn_op], Some(err));
            }
        }
    } else {
        ctx.set_last_error(&kv.key, None); // dry-run assumes success
    }

    // finalize and save before going to derived values + dependents
    {
        let node = graph.set_node(&kv.key);
        node.flags_mut().error = None;
        node.flags_mut().pending = false;
    }
    let mut executed = vec![txn_op];
    save_unless_dry_run(ctx, graph);

    // update values that depend on this kv-pair
    executed.extend(run_updates(ctx, graph, &kv.key, kv.is_revert));

    // create derived values
    let derived_vals: Vec<KvForTxn> = derives
        .into_iter()
        .map(|d| KvForTxn {
            key: d.key,
            value: Some(d.value),
            origin: kv.origin,
            metadata: None,
            is_revert: kv.is_revert,
        })
        .collect();
    let (derived_ops, was_err) = apply_derived(ctx, graph, derived_vals, true);
    executed.extend(derived_ops);

    (executed, was_err)
}

/// Deletes a value, or parks the node as pending when `pending` is set
/// (used when a still-declared value loses a dependency).
fn apply_delete(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    mut txn_op: RecordedTxnOp,
    pending: bool,
) -> (Vec<RecordedTxnOp>, Option<OpError>) {
    let (has_value, was_pending) = match graph.get_node(&kv.key) {
        Some(node) => (node.value().is_some(), node.is_pending()),
        None => (false, false),
    };

    if !has_value {
        // removing a value that does not exist => noop
        graph.delete_node(&kv.key);
        save_unless_dry_run(ctx, graph);
        return (Vec::new(), None);
    }

    if was_pending {
        // removing a value that was pending => no descriptor to call
        graph.delete_node(&kv.key);
        ctx.set_last_error(&kv.key, None);
        save_unless_dry_run(ctx, graph);
        return (vec![txn_op], None);
    }

    // mark as pending upfront so that dependents no longer see the value as
    // a satisfied dependency during the cascade
    graph.set_node(&kv.key).flags_mut().pending = true;

    // remove derived values first
    let derived_vals: Vec<KvForTxn> = graph
        .derived_node_keys(&kv.key)
        .into_iter()
        .map(|key| KvForTxn {
            key,
            value: None,
            origin: kv.origin,
            metadata: None,
            is_revert: kv.is_revert,
        })
        .collect();
    let (derived_ops, mut was_err) = apply_derived(ctx, graph, derived_vals, false);
    let mut executed = derived_ops;

    // continue even if removal of a derived value has failed ...

    // update values that depend on this kv-pair
    executed.extend(run_updates(ctx, graph, &kv.key, kv.is_revert));

    // execute delete operation
    let handler = DescriptorHandler::new(ctx.registry.descriptor_for_key(&kv.key));
    let mut err: Option<OpError> = None;
    if !ctx.dry_run && handler.descriptor().is_some() {
        if kv.origin != ValueOrigin::FromSB {
            let (value, metadata) = match graph.get_node(&kv.key) {
                Some(node) => (node.value().cloned(), node.metadata().cloned()),
                None => (None, None),
            };
            if let Some(value) = value {
                err = handler.delete(&kv.key, &value, metadata.as_ref()).err();
            }
        }
        ctx.set_last_error(&kv.key, err.clone());
        if let Some(e) = &err {
            was_err = Some(e.clone());
            // propagate error to the base value
            let base = graph.base_key(&kv.key);
            ctx.add_failed(base, handler.is_retriable_failure(e));
            propagate_error(graph, &kv.key, e.clone(), TxnOperation::Delete);
        }
        set_metadata_if_supported(graph, &handler, &kv.key, None);
    } else {
        ctx.set_last_error(&kv.key, None); // dry-run assumes success
    }

    // cleanup the error flag if the removal was successful
    if was_err.is_none() {
        graph.set_node(&kv.key).flags_mut().error = None;
    }

    // remove a non-pending derived value regardless of errors, a base value
    // only if the removal went through completely
    let is_derived_node = graph
        .get_node(&kv.key)
        .map_or(false, |node| node.is_derived());
    if !pending && (was_err.is_none() || is_derived_node) {
        graph.delete_node(&kv.key);
    } else if !pending {
        // failed removal of a base value: it is still applied southbound
        graph.set_node(&kv.key).flags_mut().pending = false;
    }

    txn_op.new_err = err;
    txn_op.is_pending = pending;
    executed.push(txn_op);
    save_unless_dry_run(ctx, graph);
    (executed, was_err)
}

/// Applies a new value to an existing, non-pending value.
fn apply_modify(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    mut txn_op: RecordedTxnOp,
) -> (Vec<RecordedTxnOp>, Option<OpError>) {
    let new_value = match kv.value.clone() {
        Some(value) => value,
        None => return apply_delete(ctx, graph, kv, txn_op, false),
    };
    let (old_value, old_metadata) = match graph.get_node(&kv.key) {
        Some(node) => (node.value().cloned(), node.metadata().cloned()),
        None => (None, None),
    };
    let old_value = match old_value {
        Some(value) => value,
        None => return apply_add(ctx, graph, kv, txn_op),
    };

    let handler = DescriptorHandler::new(ctx.registry.descriptor_for_key(&kv.key));
    let equivalent = handler.equivalent_values(&kv.key, &old_value, &new_value);

    // re-create the value if required by the descriptor
    let recreate = !equivalent
        && kv.origin != ValueOrigin::FromSB
        && handler.modify_with_recreate(&kv.key, &old_value, &new_value, old_metadata.as_ref());

    if recreate {
        // record as two operations, delete followed by add
        let mut del_op = pre_record_txn_op(ctx, graph, kv, txn_op.is_derived);
        del_op.operation = TxnOperation::Delete;
        del_op.new_value = None;
        let mut add_op = pre_record_txn_op(ctx, graph, kv, txn_op.is_derived);
        add_op.operation = TxnOperation::Add;
        add_op.prev_value = None;
        add_op.was_pending = true;

        // remove the obsolete revision of the value
        let (mut executed, err) = apply_delete(ctx, graph, kv, del_op, true);
        if let Some(err) = err {
            return (executed, Some(err));
        }
        // add the new revision
        let (add_ops, err) = apply_add(ctx, graph, kv, add_op);
        executed.extend(add_ops);
        return (executed, err);
    }

    // save the new value and recompute relations
    let prev_derived = graph.derived_target_keys(&kv.key);
    graph.set_node(&kv.key).set_value(Some(new_value.clone()));
    let derives = handler.derived_values(&kv.key, &new_value);
    let dependencies = handler.dependencies(&kv.key, &new_value);
    let targets = construct_targets(dependencies, derives.iter().map(|d| d.key.as_str()));
    graph.set_node(&kv.key).set_targets(targets);

    // remove obsolete derived values
    let mut obsolete = prev_derived;
    obsolete.subtract(&graph.derived_target_keys(&kv.key));
    let obsolete_vals: Vec<KvForTxn> = obsolete
        .iter()
        .map(|key| KvForTxn {
            key: key.to_string(),
            value: None,
            origin: kv.origin,
            metadata: None,
            is_revert: kv.is_revert,
        })
        .collect();
    let (derived_ops, mut was_err) = apply_derived(ctx, graph, obsolete_vals, false);
    let mut executed = derived_ops;

    // if the new dependencies are not satisfied => park the new revision as
    // pending
    if !graph.is_ready(&kv.key) {
        let (del_ops, err) = apply_delete(ctx, graph, kv, txn_op, true);
        executed.extend(del_ops);
        if err.is_some() {
            was_err = err;
        }
        return (executed, was_err);
    }

    // execute modify operation
    if !ctx.dry_run && !equivalent && handler.descriptor().is_some() {
        let result = if kv.origin != ValueOrigin::FromSB {
            handler.modify(&kv.key, &old_value, &new_value, old_metadata.as_ref())
        } else {
            // already modified in SB
            Ok(kv.metadata.clone())
        };
        match result {
            Ok(new_metadata) => {
                ctx.set_last_error(&kv.key, None);
                set_metadata_if_supported(graph, &handler, &kv.key, new_metadata);
            }
            Err(err) => {
                ctx.set_last_error(&kv.key, Some(err.clone()));
                // propagate error to the base value
                let base = graph.base_key(&kv.key);
                ctx.add_failed(base, handler.is_retriable_failure(&err));
                propagate_error(graph, &kv.key, err.clone(), TxnOperation::Modify);
                txn_op.new_err = Some(err.clone());
                executed.push(txn_op);
                save_unless_dry_run(ctx, graph);
                return (executed, Some(err));
            }
        }
    } else {
        ctx.set_last_error(&kv.key, None); // dry-run assumes success
    }

    // the value is equivalent but still failed from a previous transaction
    // => run Update to give the descriptor a chance to clear the error
    if equivalent && was_err.is_none() && txn_op.prev_err.is_some() {
        txn_op.operation = TxnOperation::Update;

        let mut err: Option<OpError> = None;
        if !ctx.dry_run && kv.origin != ValueOrigin::FromSB {
            let metadata = graph.get_node(&kv.key).and_then(|n| n.metadata().cloned());
            err = handler.update(&kv.key, &new_value, metadata.as_ref()).err();
        }
        ctx.set_last_error(&kv.key, err.clone());
        if let Some(err) = err {
            let base = graph.base_key(&kv.key);
            ctx.add_failed(base, handler.is_retriable_failure(&err));
            propagate_error(graph, &kv.key, err.clone(), TxnOperation::Update);
            txn_op.new_err = Some(err.clone());
            executed.push(txn_op);
            save_unless_dry_run(ctx, graph);
            return (executed, Some(err));
        }
    }

    if !equivalent || txn_op.operation == TxnOperation::Update {
        // value modified, or Update executed to clear the error
        executed.push(txn_op.clone());
    }

    if was_err.is_none() {
        graph.set_node(&kv.key).flags_mut().error = None;
    }
    save_unless_dry_run(ctx, graph);

    // update values that depend on this kv-pair
    if !equivalent {
        executed.extend(run_updates(ctx, graph, &kv.key, kv.is_revert));
    }

    // modify/add derived values
    let derived_vals: Vec<KvForTxn> = derives
        .into_iter()
        .map(|d| KvForTxn {
            key: d.key,
            value: Some(d.value),
            origin: kv.origin,
            metadata: None,
            is_revert: kv.is_revert,
        })
        .collect();
    let (derived_ops, err) = apply_derived(ctx, graph, derived_vals, true);
    executed.extend(derived_ops);
    if err.is_some() {
        was_err = err;
    }

    (executed, was_err)
}

/// Re-evaluates a value because one of its dependencies has changed.
fn apply_update(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    kv: &KvForTxn,
    mut txn_op: RecordedTxnOp,
) -> (Vec<RecordedTxnOp>, Option<OpError>) {
    let handler = DescriptorHandler::new(ctx.registry.descriptor_for_key(&kv.key));
    let is_pending = graph
        .get_node(&kv.key)
        .map_or(false, |node| node.is_pending());

    if is_pending {
        // add the value if its dependencies are now all satisfied
        if !graph.is_ready(&kv.key) {
            // nothing to do; deliberately keep the last-update flag intact
            return (Vec::new(), None);
        }
        graph.set_node(&kv.key).flags_mut().last_update = Some(ctx.txn.seq_num);
        let mut add_op = pre_record_txn_op(ctx, graph, kv, txn_op.is_derived);
        add_op.operation = TxnOperation::Add;
        return apply_add(ctx, graph, kv, add_op);
    }

    graph.set_node(&kv.key).flags_mut().last_update = Some(ctx.txn.seq_num);
    if !graph.is_ready(&kv.key) {
        // a dependency is no longer satisfied => park the value as pending
        let mut del_op = pre_record_txn_op(ctx, graph, kv, txn_op.is_derived);
        del_op.operation = TxnOperation::Delete;
        del_op.new_value = None;
        return apply_delete(ctx, graph, kv, del_op, true);
    }

    // execute update operation
    let mut err: Option<OpError> = None;
    if !ctx.dry_run {
        let (value, metadata) = match graph.get_node(&kv.key) {
            Some(node) => (node.value().cloned(), node.metadata().cloned()),
            None => (None, None),
        };
        if let Some(value) = value {
            err = handler.update(&kv.key, &value, metadata.as_ref()).err();
        }
        ctx.set_last_error(&kv.key, err.clone());
        if let Some(e) = &err {
            txn_op.new_err = Some(e.clone());
            let base = graph.base_key(&kv.key);
            ctx.add_failed(base, handler.is_retriable_failure(e));
            propagate_error(graph, &kv.key, e.clone(), TxnOperation::Update);
        }
    } else {
        ctx.set_last_error(&kv.key, None); // dry-run assumes success
    }
    save_unless_dry_run(ctx, graph);
    (vec![txn_op], err)
}

/// (Re-)applies the given list of derived values, ordered by key.
fn apply_derived(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    mut derived_vals: Vec<KvForTxn>,
    check: bool,
) -> (Vec<RecordedTxnOp>, Option<OpError>) {
    let mut was_err: Option<OpError> = None;
    let mut executed = Vec::new();

    derived_vals.sort_by(|a, b| a.key.cmp(&b.key));

    for derived in derived_vals {
        if check && !valid_derived_kv(ctx, graph, &derived) {
            continue;
        }
        let (ops, _, err) = apply_value(ctx, graph, &derived, false, true);
        if let Some(err) = err {
            was_err = Some(err);
        }
        executed.extend(ops);
    }
    (executed, was_err)
}

/// Triggers Update on every node that depends on the given key, ordered by
/// key for determinism. SB-originated dependents are never re-applied from
/// here.
fn run_updates(
    ctx: &mut ApplyCtx<'_>,
    graph: &mut GraphWriter<'_>,
    key: &str,
    is_revert: bool,
) -> Vec<RecordedTxnOp> {
    let mut executed = Vec::new();
    for dep_key in graph.dependency_sources(key) {
        let (origin, value) = match graph.get_node(&dep_key) {
            Some(node) => (node.origin(), node.value().cloned()),
            None => continue,
        };
        if origin != ValueOrigin::FromNB {
            continue;
        }
        let kv = KvForTxn {
            key: dep_key,
            value,
            origin,
            metadata: None,
            is_revert,
        };
        let (ops, _, _) = apply_value(ctx, graph, &kv, true, false);
        executed.extend(ops);
    }
    executed
}

/// Validity check for a derived KV pair before it is applied.
fn valid_derived_kv(ctx: &ApplyCtx<'_>, graph: &GraphWriter<'_>, kv: &KvForTxn) -> bool {
    if kv.value.is_none() {
        warn!("txn #{}: derived nil value for {}", ctx.txn.seq_num, kv.key);
        return false;
    }
    if let Some(node) = graph.get_node(&kv.key) {
        if !node.is_derived() {
            warn!(
                "txn #{}: skipping derived value colliding with base value {}",
                ctx.txn.seq_num, kv.key
            );
            return false;
        }
    }
    true
}

/// Propagates an error from a node to its base and stores it in the error
/// flag.
fn propagate_error(graph: &mut GraphWriter<'_>, key: &str, err: OpError, operation: TxnOperation) {
    let base_key = graph.base_key(key);
    graph.set_node(&base_key).flags_mut().error = Some(ErrorFlag {
        error: err,
        operation,
    });
}

/// Pre-fills an op record with the attributes known before execution.
fn pre_record_txn_op(
    ctx: &ApplyCtx<'_>,
    graph: &GraphWriter<'_>,
    kv: &KvForTxn,
    is_derived: bool,
) -> RecordedTxnOp {
    let (prev_value, prev_origin, was_pending, node_derived) = match graph.get_node(&kv.key) {
        Some(node) => (
            node.value().cloned(),
            node.origin(),
            node.is_pending(),
            node.is_derived(),
        ),
        None => (None, ValueOrigin::Unknown, false, false),
    };
    RecordedTxnOp {
        key: kv.key.clone(),
        operation: TxnOperation::Update, // replaced by the caller
        prev_value,
        new_value: kv.value.clone(),
        prev_origin,
        new_origin: kv.origin,
        prev_err: ctx.last_error(&kv.key),
        new_err: None,
        was_pending,
        is_pending: false,
        is_derived: node_derived || is_derived,
        is_revert: kv.is_revert,
    }
}

fn set_metadata_if_supported(
    graph: &mut GraphWriter<'_>,
    handler: &DescriptorHandler<'_>,
    key: &str,
    metadata: Option<crate::value::Metadata>,
) {
    let with_metadata = handler
        .descriptor()
        .map_or(false, |descriptor| descriptor.with_metadata);
    let derived = graph.get_node(key).map_or(false, |node| node.is_derived());
    if with_metadata && !derived {
        graph.set_node(key).set_metadata(metadata);
    }
}

fn save_unless_dry_run(ctx: &ApplyCtx<'_>, graph: &mut GraphWriter<'_>) {
    if !ctx.dry_run {
        graph.save();
    }
}

/// Removes uninteresting intermediate pending Add/Delete operations from the
/// recorded stream, so that e.g. a re-created value shows one net Delete and
/// one net Add.
pub(crate) fn compress_txn_ops(executed: Vec<RecordedTxnOp>) -> Vec<RecordedTxnOp> {
    // compress Add operations forward
    let mut ops = executed;
    let mut dropped = vec![false; ops.len()];
    for i in 0..ops.len() {
        let mergeable = ops[i].operation == TxnOperation::Add
            && ops[i].is_pending
            && ops[i].new_err.is_none();
        if !mergeable {
            continue;
        }
        let next = (i + 1..ops.len()).find(|&j| ops[j].key == ops[i].key);
        if let Some(j) = next {
            if ops[j].operation == TxnOperation::Add {
                let (prev_value, prev_err, prev_origin, was_pending) = (
                    ops[i].prev_value.clone(),
                    ops[i].prev_err.clone(),
                    ops[i].prev_origin,
                    ops[i].was_pending,
                );
                ops[j].prev_value = prev_value;
                ops[j].prev_err = prev_err;
                ops[j].prev_origin = prev_origin;
                ops[j].was_pending = was_pending;
                dropped[i] = true;
            }
        }
    }
    let mut compressed: Vec<RecordedTxnOp> = ops
        .into_iter()
        .zip(dropped)
        .filter(|(_, dropped)| !dropped)
        .map(|(op, _)| op)
        .collect();

    // compress Delete operations backward
    let mut dropped = vec![false; compressed.len()];
    for i in (0..compressed.len()).rev() {
        let mergeable = compressed[i].operation == TxnOperation::Delete
            && compressed[i].was_pending
            && compressed[i].prev_err.is_none();
        if !mergeable {
            continue;
        }
        let previous = (0..i).rev().find(|&j| compressed[j].key == compressed[i].key);
        if let Some(j) = previous {
            if compressed[j].operation == TxnOperation::Delete {
                let (new_value, new_err, new_origin, is_pending) = (
                    compressed[i].new_value.clone(),
                    compressed[i].new_err.clone(),
                    compressed[i].new_origin,
                    compressed[i].is_pending,
                );
                compressed[j].new_value = new_value;
                compressed[j].new_err = new_err;
                compressed[j].new_origin = new_origin;
                compressed[j].is_pending = is_pending;
                dropped[i] = true;
            }
        }
    }
    compressed
        .into_iter()
        .zip(dropped)
        .filter(|(_, dropped)| !dropped)
        .map(|(op, _)| op)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Dependency, KVDescriptor};
    use crate::txn::ResyncType;
    use crate::value::value;

    fn test_registry() -> DescriptorRegistry {
        let mut descriptor = KVDescriptor::new("test", |key: &str| key.starts_with("t/"));
        descriptor.dependencies = Some(Box::new(|key, _value| {
            if key == "t/a" {
                vec![Dependency::on_key("b", "t/b")]
            } else {
                Vec::new()
            }
        }));
        let mut registry = DescriptorRegistry::new();
        registry.register(descriptor);
        registry
    }

    fn nb_txn(seq_num: u64, values: Vec<(&str, Option<Value>)>) -> PreProcessedTxn {
        PreProcessedTxn {
            seq_num,
            source: TxnSource::Nb {
                retry: RetryPolicy::default(),
                revert_on_failure: false,
                resync: ResyncType::None,
            },
            values: values
                .into_iter()
                .map(|(key, value)| KvForTxn {
                    key: key.to_string(),
                    value,
                    origin: ValueOrigin::FromNB,
                    metadata: None,
                    is_revert: false,
                })
                .collect(),
            description: String::new(),
        }
    }

    #[test]
    fn pending_value_is_promoted_when_dependency_arrives() {
        let graph = Graph::new();
        let registry = test_registry();
        let mut last_error = LastErrors::default();

        let txn = nb_txn(0, vec![("t/a", Some(value(1u32)))]);
        let (ops, failed) = execute_transaction(&graph, &registry, &mut last_error, &txn, false);
        assert!(failed.is_empty());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_pending);
        assert!(graph.read().get_node("t/a").unwrap().is_pending());

        let txn = nb_txn(1, vec![("t/b", Some(value(2u32)))]);
        let (ops, failed) = execute_transaction(&graph, &registry, &mut last_error, &txn, false);
        assert!(failed.is_empty());
        let keys: Vec<&str> = ops.iter().map(|op| op.key.as_str()).collect();
        assert_eq!(keys, vec!["t/b", "t/a"]);
        assert!(!graph.read().get_node("t/a").unwrap().is_pending());
    }

    #[test]
    fn dry_run_leaves_the_graph_and_last_errors_untouched() {
        let graph = Graph::new();
        let registry = test_registry();
        let mut last_error = LastErrors::default();

        let txn = nb_txn(0, vec![("t/b", Some(value(1u32)))]);
        let (ops, failed) = execute_transaction(&graph, &registry, &mut last_error, &txn, true);
        assert!(failed.is_empty());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, TxnOperation::Add);
        assert!(graph.read().get_node("t/b").is_none());
        assert!(last_error.is_empty());
    }

    fn op(key: &str, operation: TxnOperation) -> RecordedTxnOp {
        RecordedTxnOp {
            key: key.to_string(),
            operation,
            prev_value: None,
            new_value: Some(value(key.to_string())),
            prev_origin: ValueOrigin::Unknown,
            new_origin: ValueOrigin::FromNB,
            prev_err: None,
            new_err: None,
            was_pending: false,
            is_pending: false,
            is_derived: false,
            is_revert: false,
        }
    }

    #[test]
    fn pending_add_merges_into_later_add() {
        let mut pending_add = op("a", TxnOperation::Add);
        pending_add.is_pending = true;
        let mut dep_add = op("b", TxnOperation::Add);
        dep_add.was_pending = false;
        let applied_add = op("a", TxnOperation::Add);

        let compressed = compress_txn_ops(vec![pending_add, dep_add, applied_add]);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].key, "b");
        assert_eq!(compressed[1].key, "a");
        assert_eq!(compressed[1].operation, TxnOperation::Add);
        assert!(!compressed[1].is_pending);
    }

    #[test]
    fn pending_delete_merges_into_earlier_delete() {
        let mut first_delete = op("a", TxnOperation::Delete);
        first_delete.new_value = None;
        first_delete.is_pending = true;
        let mut second_delete = op("a", TxnOperation::Delete);
        second_delete.new_value = None;
        second_delete.was_pending = true;

        let compressed = compress_txn_ops(vec![first_delete, second_delete]);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].operation, TxnOperation::Delete);
        assert!(!compressed[0].is_pending);
    }

    #[test]
    fn failed_pending_add_is_kept() {
        let mut failed_add = op("a", TxnOperation::Add);
        failed_add.is_pending = true;
        failed_add.new_err = Some(crate::error::KvError::TxnQueueFull.into_op_error());
        let applied_add = op("a", TxnOperation::Add);

        let compressed = compress_txn_ops(vec![failed_add, applied_add]);
        assert_eq!(compressed.len(), 2);
    }

    #[test]
    fn compression_is_a_fixed_point() {
        let mut pending_add = op("a", TxnOperation::Add);
        pending_add.is_pending = true;
        let ops = vec![
            pending_add,
            op("b", TxnOperation::Add),
            op("a", TxnOperation::Add),
            op("c", TxnOperation::Modify),
        ];
        let once = compress_txn_ops(ops);
        let keys_once: Vec<(String, TxnOperation)> = once
            .iter()
            .map(|op| (op.key.clone(), op.operation))
            .collect();
        let twice = compress_txn_ops(once);
        let keys_twice: Vec<(String, TxnOperation)> = twice
            .iter()
            .map(|op| (op.key.clone(), op.operation))
            .collect();
        assert_eq!(keys_once, keys_twice);
    }
}
