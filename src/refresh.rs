//! Rebasing the graph against the southbound view.
//!
//! Descriptors with a dump capability are asked for the SB state of the
//! values they own, in an order that respects their declared dump
//! dependencies. The graph is then rewritten to match: dumped values are
//! (re-)installed as applied, values that vanished from SB are dropped so
//! that a follow-up transaction re-adds them as pending.

use log::{info, warn};

use crate::descriptor::KVWithMetadata;
use crate::graph::{construct_targets, GraphWriter};
use crate::handler::DescriptorHandler;
use crate::keyset::KeySet;
use crate::registry::DescriptorRegistry;

/// Refreshes the SB view of the graph. With `keys` given, only those keys
/// are touched (used to re-read a failed value before a revert).
pub(crate) fn refresh_graph(
    graph: &mut GraphWriter<'_>,
    registry: &DescriptorRegistry,
    keys: Option<&KeySet>,
    verbose: bool,
) {
    let in_scope = |key: &str| keys.map_or(true, |keys| keys.has(key));

    for name in registry.dump_order() {
        let descriptor = match registry.get(&name) {
            Some(descriptor) => descriptor,
            None => continue,
        };
        let dump = match descriptor.dump.as_ref() {
            Some(dump) => dump,
            None => continue,
        };
        let handler = DescriptorHandler::new(Some(descriptor));

        // correlate with the current (mostly NB-declared) content
        let owned = graph.keys_where(|node| {
            node.flags().descriptor.as_deref() == Some(name.as_str()) && !node.is_derived()
        });
        let correlate: Vec<KVWithMetadata> = owned
            .iter()
            .filter_map(|key| {
                let node = graph.get_node(key)?;
                let value = node.value()?.clone();
                Some(KVWithMetadata {
                    key: key.clone(),
                    value,
                    metadata: node.metadata().cloned(),
                    origin: node.origin(),
                })
            })
            .collect();

        let dumped = match dump(&correlate) {
            Ok(dumped) => dumped,
            Err(err) => {
                warn!("refresh: dump of descriptor {} failed: {}", name, err);
                continue;
            }
        };

        let mut dumped_keys = KeySet::new();
        for kv in dumped {
            if !in_scope(&kv.key) {
                continue;
            }
            if verbose {
                info!("refresh: {} {} = {:?}", name, kv.key, kv.value);
            }
            dumped_keys.add(kv.key.clone());

            let derives = handler.derived_values(&kv.key, &kv.value);
            let dependencies = handler.dependencies(&kv.key, &kv.value);
            let targets = construct_targets(dependencies, derives.iter().map(|d| d.key.as_str()));
            let label = handler.key_label(&kv.key);

            let node = graph.set_node(&kv.key);
            node.set_value(Some(kv.value));
            node.set_metadata(kv.metadata);
            node.set_label(label);
            node.set_targets(targets);
            node.flags_mut().descriptor = Some(name.clone());
            node.flags_mut().origin = kv.origin;
            node.flags_mut().pending = false;
        }

        // values that disappeared from SB are dropped; the NB intent, if
        // any, will re-add them as pending in a follow-up transaction
        for key in owned {
            if !in_scope(&key) || dumped_keys.has(&key) {
                continue;
            }
            let pending = graph.get_node(&key).map_or(false, |node| node.is_pending());
            if pending {
                continue;
            }
            for derived in graph.derived_node_keys(&key) {
                graph.delete_node(&derived);
            }
            graph.delete_node(&key);
        }
    }
}
