//! Unordered sets of keys with deterministic iteration.

use std::hash::BuildHasherDefault;

use rustc_hash::FxHasher;

type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<FxHasher>>;

/// An insertion-ordered set of keys.
///
/// Iteration is deterministic (insertion order); [`KeySet::sorted`] yields
/// keys in ascending order where the caller needs a total order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: FxIndexSet<String>,
}

impl KeySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding a single key.
    pub fn singleton(key: impl Into<String>) -> Self {
        let mut set = Self::new();
        set.add(key);
        set
    }

    /// Inserts a key; returns true if it was not present.
    pub fn add(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    /// Removes a key; returns true if it was present.
    pub fn del(&mut self, key: &str) -> bool {
        self.keys.shift_remove(key)
    }

    /// Membership test.
    pub fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates keys in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.as_str())
    }

    /// Keys in ascending order.
    pub fn sorted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Adds every key of `other` into this set.
    pub fn union(&mut self, other: &KeySet) {
        for key in other.iter() {
            self.add(key);
        }
    }

    /// Removes every key of `other` from this set.
    pub fn subtract(&mut self, other: &KeySet) {
        for key in other.iter() {
            self.del(key);
        }
    }
}

impl std::iter::FromIterator<String> for KeySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = KeySet::new();
        for key in iter {
            set.add(key);
        }
        set
    }
}
