//! In-memory graph store of configuration values.
//!
//! A directed multigraph of nodes keyed by string, with two typed edge
//! relations (Dependency and Derived). The store hands out cheap read
//! snapshots and exclusive copy-on-write write handles: mutations buffered
//! in a write handle become visible to readers only on [`GraphWriter::save`],
//! and are discarded when the handle is released unsaved (or when the handle
//! was opened as non-persisting, which is how dry-runs execute).

mod node;

pub use node::{
    EdgeRelation, ErrorFlag, LastChangeFlag, Node, NodeFlags, RelationTarget, RetryPolicy,
};

use std::hash::BuildHasherDefault;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use rustc_hash::FxHasher;
use smallvec::SmallVec;

use crate::descriptor::{Dependency, DependencyTarget};
use crate::keyset::KeySet;

type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

#[derive(Clone, Default)]
struct GraphState {
    nodes: FxIndexMap<String, Node>,
}

impl GraphState {
    fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// A node satisfies dependents when it exists, holds a value and is not
    /// pending.
    fn satisfies(&self, key: &str) -> bool {
        match self.nodes.get(key) {
            Some(node) => node.value().is_some() && !node.is_pending(),
            None => false,
        }
    }

    /// True if every Dependency edge of the node resolves to an applied
    /// target. `AnyOf` targets need at least one satisfying node.
    fn is_ready(&self, key: &str) -> bool {
        let node = match self.nodes.get(key) {
            Some(node) => node,
            None => return false,
        };
        node.targets()
            .iter()
            .filter(|t| t.relation == EdgeRelation::Dependency)
            .all(|t| match &t.target {
                DependencyTarget::Key(target) => self.satisfies(target),
                DependencyTarget::AnyOf(selector) => self
                    .nodes
                    .iter()
                    .any(|(key, _)| selector(key) && self.satisfies(key)),
            })
    }

    /// Keys of nodes with a Dependency edge resolving to `key`, ascending.
    fn dependency_sources(&self, key: &str) -> Vec<String> {
        let mut sources: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.targets()
                    .iter()
                    .any(|t| t.relation == EdgeRelation::Dependency && t.matches(key))
            })
            .map(|(source, _)| source.clone())
            .collect();
        sources.sort();
        sources
    }

    /// Key of the node that derives `key`, if any.
    fn derived_source(&self, key: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| {
                node.targets()
                    .iter()
                    .any(|t| t.relation == EdgeRelation::Derived && t.matches(key))
            })
            .map(|(source, _)| source.clone())
    }

    /// Walks Derived edges backwards until a base node is reached.
    fn base_key(&self, key: &str) -> String {
        let mut current = key.to_string();
        let mut visited = KeySet::singleton(key);
        loop {
            let derived = match self.nodes.get(&current) {
                Some(node) => node.is_derived(),
                None => false,
            };
            if !derived {
                return current;
            }
            match self.derived_source(&current) {
                Some(source) if visited.add(source.clone()) => current = source,
                _ => return current,
            }
        }
    }

    /// Derived targets of `key` that currently exist as nodes, ascending.
    fn derived_node_keys(&self, key: &str) -> Vec<String> {
        let node = match self.nodes.get(key) {
            Some(node) => node,
            None => return Vec::new(),
        };
        let mut keys: Vec<String> = node
            .derived_target_keys()
            .filter(|derived| self.nodes.contains_key(*derived))
            .map(|derived| derived.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// All Derived target keys of `key` as a set.
    fn derived_target_keys(&self, key: &str) -> KeySet {
        match self.nodes.get(key) {
            Some(node) => node.derived_target_keys().map(str::to_string).collect(),
            None => KeySet::new(),
        }
    }

    fn keys_where(&self, predicate: impl Fn(&Node) -> bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| predicate(node))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// The graph store. Single writer, multiple readers.
#[derive(Default)]
pub struct Graph {
    state: RwLock<GraphState>,
    writer: Mutex<()>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a read snapshot. Multiple concurrent readers are allowed; the
    /// snapshot observes only saved writes.
    pub fn read(&self) -> GraphReader<'_> {
        GraphReader {
            state: self.state.read(),
        }
    }

    /// Opens an exclusive write handle over a copy-on-write overlay.
    ///
    /// With `persist == false` the overlay is discarded even on `save`;
    /// this is how dry-run transactions execute against a scratch copy.
    pub fn write(&self, persist: bool) -> GraphWriter<'_> {
        let serial = self.writer.lock();
        let overlay = self.state.read().clone();
        GraphWriter {
            graph: self,
            _serial: serial,
            overlay,
            persist,
        }
    }
}

/// Read snapshot of the graph.
pub struct GraphReader<'a> {
    state: RwLockReadGuard<'a, GraphState>,
}

impl<'a> GraphReader<'a> {
    /// Looks a node up by key.
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.state.get(key)
    }

    /// Iterates all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.state.nodes.values()
    }

    /// Keys of nodes matching the predicate, in insertion order.
    pub fn keys_where(&self, predicate: impl Fn(&Node) -> bool) -> Vec<String> {
        self.state.keys_where(predicate)
    }

    /// See [`GraphWriter::is_ready`].
    pub fn is_ready(&self, key: &str) -> bool {
        self.state.is_ready(key)
    }

    /// Walks Derived edges backwards to the base node's key.
    pub fn base_key(&self, key: &str) -> String {
        self.state.base_key(key)
    }
}

/// Exclusive write handle over a copy-on-write overlay of the graph.
pub struct GraphWriter<'a> {
    graph: &'a Graph,
    _serial: MutexGuard<'a, ()>,
    overlay: GraphState,
    persist: bool,
}

impl<'a> GraphWriter<'a> {
    /// Returns a mutable view of the node, creating it if absent.
    pub fn set_node(&mut self, key: &str) -> &mut Node {
        self.overlay
            .nodes
            .entry(key.to_string())
            .or_insert_with(|| Node::new(key))
    }

    /// Looks a node up by key.
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.overlay.get(key)
    }

    /// Removes a node. Returns true if it existed.
    pub fn delete_node(&mut self, key: &str) -> bool {
        self.overlay.nodes.shift_remove(key).is_some()
    }

    /// Keys of nodes matching the predicate, in insertion order.
    pub fn keys_where(&self, predicate: impl Fn(&Node) -> bool) -> Vec<String> {
        self.overlay.keys_where(predicate)
    }

    /// True if every Dependency edge of the node resolves to a node that
    /// exists, holds a value and is not pending.
    pub fn is_ready(&self, key: &str) -> bool {
        self.overlay.is_ready(key)
    }

    /// Keys of nodes depending on `key`, ascending (deterministic cascade
    /// order).
    pub fn dependency_sources(&self, key: &str) -> Vec<String> {
        self.overlay.dependency_sources(key)
    }

    /// Derived targets of `key` that currently exist as nodes, ascending.
    pub fn derived_node_keys(&self, key: &str) -> Vec<String> {
        self.overlay.derived_node_keys(key)
    }

    /// All Derived target keys of `key`.
    pub fn derived_target_keys(&self, key: &str) -> KeySet {
        self.overlay.derived_target_keys(key)
    }

    /// Walks Derived edges backwards to the base node's key.
    pub fn base_key(&self, key: &str) -> String {
        self.overlay.base_key(key)
    }

    /// Publishes buffered mutations to readers. A non-persisting handle
    /// keeps buffering without publishing.
    pub fn save(&mut self) {
        if self.persist {
            *self.graph.state.write() = self.overlay.clone();
        }
    }
}

/// Builds the full edge set of a node from its descriptor-computed
/// dependencies and derived keys.
pub(crate) fn construct_targets<'d>(
    dependencies: Vec<Dependency>,
    derived: impl Iterator<Item = &'d str>,
) -> SmallVec<[RelationTarget; 4]> {
    let mut targets = SmallVec::new();
    for dep in dependencies {
        targets.push(RelationTarget {
            relation: EdgeRelation::Dependency,
            label: dep.label,
            target: dep.target,
        });
    }
    for key in derived {
        targets.push(RelationTarget {
            relation: EdgeRelation::Derived,
            label: key.to_string(),
            target: DependencyTarget::Key(key.to_string()),
        });
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;

    fn add_node(writer: &mut GraphWriter<'_>, key: &str, deps: Vec<Dependency>) {
        let targets = construct_targets(deps, std::iter::empty());
        let node = writer.set_node(key);
        node.set_value(Some(value(key.to_string())));
        node.set_targets(targets);
    }

    #[test]
    fn unsaved_writes_are_discarded() {
        let graph = Graph::new();
        {
            let mut writer = graph.write(true);
            add_node(&mut writer, "a", vec![]);
            // released without save
        }
        assert!(graph.read().get_node("a").is_none());

        {
            let mut writer = graph.write(true);
            add_node(&mut writer, "a", vec![]);
            writer.save();
        }
        assert!(graph.read().get_node("a").is_some());
    }

    #[test]
    fn non_persisting_writer_never_publishes() {
        let graph = Graph::new();
        let mut writer = graph.write(false);
        add_node(&mut writer, "a", vec![]);
        writer.save();
        drop(writer);
        assert!(graph.read().get_node("a").is_none());
    }

    #[test]
    fn readiness_follows_dependency_edges() {
        let graph = Graph::new();
        let mut writer = graph.write(true);
        add_node(
            &mut writer,
            "route",
            vec![Dependency::on_key("iface", "if/eth0")],
        );
        assert!(!writer.is_ready("route"));

        add_node(&mut writer, "if/eth0", vec![]);
        assert!(writer.is_ready("route"));

        writer.set_node("if/eth0").flags_mut().pending = true;
        assert!(!writer.is_ready("route"));
    }

    #[test]
    fn any_of_dependency_matches_by_selector() {
        let graph = Graph::new();
        let mut writer = graph.write(true);
        add_node(
            &mut writer,
            "nat",
            vec![Dependency::any_of("some-iface", |key| {
                key.starts_with("if/")
            })],
        );
        assert!(!writer.is_ready("nat"));
        add_node(&mut writer, "if/eth1", vec![]);
        assert!(writer.is_ready("nat"));
        assert_eq!(writer.dependency_sources("if/eth1"), vec!["nat"]);
    }

    #[test]
    fn base_key_walks_derived_edges() {
        let graph = Graph::new();
        let mut writer = graph.write(true);
        {
            let targets = construct_targets(vec![], vec!["a/child"].into_iter());
            let node = writer.set_node("a");
            node.set_value(Some(value(1u32)));
            node.set_targets(targets);
        }
        {
            let node = writer.set_node("a/child");
            node.set_value(Some(value(2u32)));
            node.flags_mut().derived = true;
        }
        assert_eq!(writer.base_key("a/child"), "a");
        assert_eq!(writer.base_key("a"), "a");
        assert_eq!(writer.derived_node_keys("a"), vec!["a/child"]);
    }
}
