//! Adapter that invokes descriptor callbacks with safe defaults for the
//! capabilities a descriptor omits.

use crate::descriptor::{Dependency, KVDescriptor, KeyValuePair};
use crate::error::OpError;
use crate::value::{Metadata, Value};

/// Wraps an optional descriptor reference and supplies defaults, so the
/// executor never needs to branch on which capabilities are present.
pub(crate) struct DescriptorHandler<'a> {
    descriptor: Option<&'a KVDescriptor>,
}

impl<'a> DescriptorHandler<'a> {
    pub(crate) fn new(descriptor: Option<&'a KVDescriptor>) -> Self {
        DescriptorHandler { descriptor }
    }

    pub(crate) fn descriptor(&self) -> Option<&'a KVDescriptor> {
        self.descriptor
    }

    /// Display label for the key; defaults to the key itself.
    pub(crate) fn key_label(&self, key: &str) -> String {
        match self.descriptor.and_then(|d| d.key_label.as_ref()) {
            Some(label) => label(key),
            None => key.to_string(),
        }
    }

    /// Equivalence of two revisions of a value; defaults to downcast +
    /// `PartialEq`.
    pub(crate) fn equivalent_values(&self, key: &str, old: &Value, new: &Value) -> bool {
        match self.descriptor.and_then(|d| d.value_comparator.as_ref()) {
            Some(comparator) => comparator(key, old, new),
            None => old.equivalent(&**new),
        }
    }

    pub(crate) fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, OpError> {
        match self.descriptor.and_then(|d| d.add.as_ref()) {
            Some(add) => add(key, value),
            None => Ok(None),
        }
    }

    pub(crate) fn delete(
        &self,
        key: &str,
        value: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<(), OpError> {
        match self.descriptor.and_then(|d| d.delete.as_ref()) {
            Some(delete) => delete(key, value, metadata),
            None => Ok(()),
        }
    }

    pub(crate) fn modify(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, OpError> {
        match self.descriptor.and_then(|d| d.modify.as_ref()) {
            Some(modify) => modify(key, old, new, metadata),
            None => Ok(metadata.cloned()),
        }
    }

    /// Whether the change must be applied as delete + add. A descriptor
    /// without a modify callback recreates on every change.
    pub(crate) fn modify_with_recreate(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> bool {
        let descriptor = match self.descriptor {
            Some(descriptor) => descriptor,
            None => return false,
        };
        match descriptor.modify_with_recreate.as_ref() {
            Some(recreate) => recreate(key, old, new, metadata),
            None => descriptor.modify.is_none(),
        }
    }

    pub(crate) fn update(
        &self,
        key: &str,
        value: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<(), OpError> {
        match self.descriptor.and_then(|d| d.update.as_ref()) {
            Some(update) => update(key, value, metadata),
            None => Ok(()),
        }
    }

    /// Failures are retriable unless the descriptor says otherwise.
    pub(crate) fn is_retriable_failure(&self, err: &OpError) -> bool {
        match self.descriptor.and_then(|d| d.is_retriable_failure.as_ref()) {
            Some(retriable) => retriable(err),
            None => true,
        }
    }

    pub(crate) fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        match self.descriptor.and_then(|d| d.dependencies.as_ref()) {
            Some(dependencies) => dependencies(key, value),
            None => Vec::new(),
        }
    }

    pub(crate) fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
        match self.descriptor.and_then(|d| d.derived_values.as_ref()) {
            Some(derived) => derived(key, value),
            None => Vec::new(),
        }
    }
}
