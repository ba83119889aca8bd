//! Nodes of the configuration graph: value, flags and typed edges.

use std::fmt;
use std::time::Duration;

use smallvec::SmallVec;

use crate::descriptor::DependencyTarget;
use crate::error::OpError;
use crate::txn::TxnOperation;
use crate::value::{Metadata, Value, ValueOrigin};

/// The two edge relations of the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EdgeRelation {
    /// The source node requires the target key to be applied.
    Dependency,
    /// The target key's value is derived from (and lifecycle-bound to) the
    /// source node.
    Derived,
}

/// One outgoing typed edge of a node.
#[derive(Clone, Debug)]
pub struct RelationTarget {
    /// Which relation the edge belongs to.
    pub relation: EdgeRelation,
    /// Label of the edge (dependency label, or the derived key).
    pub label: String,
    /// What the edge points at. Derived edges always use a concrete key.
    pub target: DependencyTarget,
}

impl RelationTarget {
    /// Returns true if the edge can point at the given key.
    pub fn matches(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(target) => target == key,
            DependencyTarget::AnyOf(selector) => selector(key),
        }
    }
}

/// Retry policy captured from the transaction that last changed a value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whether failed operations should be re-tried.
    pub enabled: bool,
    /// Delay before the first retry.
    pub period: Duration,
    /// Whether each successive retry doubles the delay.
    pub exp_backoff: bool,
}

/// Snapshot of the last NB-visible change of a node.
#[derive(Clone, Debug)]
pub struct LastChangeFlag {
    /// Sequence number of the transaction that performed the change.
    pub txn_seq_num: u64,
    /// The declared value (`None` = delete).
    pub value: Option<Value>,
    /// Origin of the declared value.
    pub origin: ValueOrigin,
    /// Whether the change was a revert of a failed transaction.
    pub revert: bool,
    /// Retry policy of the declaring transaction.
    pub retry: RetryPolicy,
}

/// Error propagated up to a base node from any of its derived descendants.
#[derive(Clone, Debug)]
pub struct ErrorFlag {
    /// The propagated error.
    pub error: OpError,
    /// The operation that produced it.
    pub operation: TxnOperation,
}

/// The typed flag set of a node. Flags live in one flat struct so that the
/// executor's fast path (pending/derived/origin) is branch-free.
#[derive(Clone, Debug, Default)]
pub struct NodeFlags {
    /// Sequence number of the transaction that last touched this node.
    pub last_update: Option<u64>,
    /// Snapshot of the last change, with retry policy.
    pub last_change: Option<LastChangeFlag>,
    /// Origin of the node's value.
    pub origin: ValueOrigin,
    /// Name of the owning descriptor, if any.
    pub descriptor: Option<String>,
    /// Value declared but not applied: some dependency is unsatisfied.
    pub pending: bool,
    /// The node was produced as a derived value of some base node.
    pub derived: bool,
    /// Last applied operation on this node (or a derived descendant) failed.
    pub error: Option<ErrorFlag>,
}

/// A node of the graph: one per key currently known.
#[derive(Clone)]
pub struct Node {
    key: String,
    label: String,
    value: Option<Value>,
    metadata: Option<Metadata>,
    flags: NodeFlags,
    targets: SmallVec<[RelationTarget; 4]>,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Node {
            key: key.to_string(),
            label: key.to_string(),
            value: None,
            metadata: None,
            flags: NodeFlags::default(),
            targets: SmallVec::new(),
        }
    }

    /// The key of the node.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human-readable label, supplied by the owning descriptor.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    /// The node's value; `None` for a transiently known dependency slot.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn set_value(&mut self, value: Option<Value>) {
        self.value = value;
    }

    /// Descriptor-produced metadata of the applied value.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub(crate) fn set_metadata(&mut self, metadata: Option<Metadata>) {
        self.metadata = metadata;
    }

    /// The typed flag set.
    pub fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut NodeFlags {
        &mut self.flags
    }

    /// Outgoing typed edges.
    pub fn targets(&self) -> &[RelationTarget] {
        &self.targets
    }

    /// Replaces the full Dependency + Derived edge set.
    pub(crate) fn set_targets(&mut self, targets: SmallVec<[RelationTarget; 4]>) {
        self.targets = targets;
    }

    /// True if the node's value is declared but not applied.
    pub fn is_pending(&self) -> bool {
        self.flags.pending
    }

    /// True if the node was produced as a derived value.
    pub fn is_derived(&self) -> bool {
        self.flags.derived
    }

    /// Origin of the node's value.
    pub fn origin(&self) -> ValueOrigin {
        self.flags.origin
    }

    /// Keys of all Derived targets, whether or not they exist as nodes.
    pub fn derived_target_keys(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().filter_map(|t| {
            if t.relation != EdgeRelation::Derived {
                return None;
            }
            match &t.target {
                DependencyTarget::Key(key) => Some(key.as_str()),
                DependencyTarget::AnyOf(_) => None,
            }
        })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("value", &self.value)
            .field("has_metadata", &self.metadata.is_some())
            .field("flags", &self.flags)
            .field("targets", &self.targets)
            .finish()
    }
}
