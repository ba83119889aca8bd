//! Descriptor contract: the plug-in surface the scheduler core consumes.
//!
//! A descriptor teaches the scheduler how to apply values of one key family:
//! how to add/modify/delete/update them southbound, which other keys they
//! depend on and which values they derive. Capabilities are carried as a
//! tagged record of callbacks rather than a trait hierarchy, so descriptors
//! can be sparsely specified; [`DescriptorHandler`](crate::handler) fills in
//! the defaults.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{KvError, OpError};
use crate::value::{Metadata, Value, ValueOrigin};

/// Predicate over keys.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A key-value pair.
#[derive(Clone, Debug)]
pub struct KeyValuePair {
    /// Key identifying the value.
    pub key: String,
    /// The value itself.
    pub value: Value,
}

/// A key-value pair with metadata and origin, as exchanged with `dump`.
#[derive(Clone, Debug)]
pub struct KVWithMetadata {
    /// Key identifying the value.
    pub key: String,
    /// The value itself.
    pub value: Value,
    /// Metadata of the applied value, if any.
    pub metadata: Option<Metadata>,
    /// Where the value originated from.
    pub origin: ValueOrigin,
}

/// What a dependency points at: a specific key, or any key satisfying a
/// predicate.
#[derive(Clone)]
pub enum DependencyTarget {
    /// The dependency is satisfied once this exact key is applied.
    Key(String),
    /// The dependency is satisfied once at least one key matching the
    /// predicate is applied.
    AnyOf(KeySelector),
}

impl fmt::Debug for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyTarget::Key(key) => f.debug_tuple("Key").field(key).finish(),
            DependencyTarget::AnyOf(_) => f.debug_tuple("AnyOf").field(&"<selector>").finish(),
        }
    }
}

/// A named requirement that another value exists and is applied.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// Human-readable label of the dependency, unique within one value.
    pub label: String,
    /// What the dependency points at.
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on one specific key.
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Dependency {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency satisfied by any key matching the selector.
    pub fn any_of(
        label: impl Into<String>,
        selector: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Dependency {
            label: label.into(),
            target: DependencyTarget::AnyOf(Arc::new(selector)),
        }
    }
}

/// Descriptor-local secondary index from value labels to metadata.
pub trait MetadataMap: Send {
    /// Inserts or replaces the entry for `label`.
    fn put(&mut self, label: &str, metadata: Metadata);
    /// Looks up the entry for `label`.
    fn get(&self, label: &str) -> Option<Metadata>;
    /// All labels currently present.
    fn labels(&self) -> Vec<String>;
}

/// The default label -> metadata map.
#[derive(Default)]
pub struct DefaultMetadataMap {
    entries: FxHashMap<String, Metadata>,
}

impl MetadataMap for DefaultMetadataMap {
    fn put(&mut self, label: &str, metadata: Metadata) {
        self.entries.insert(label.to_string(), metadata);
    }

    fn get(&self, label: &str) -> Option<Metadata> {
        self.entries.get(label).cloned()
    }

    fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.entries.keys().cloned().collect();
        labels.sort();
        labels
    }
}

/// Factory for descriptor-local metadata maps.
pub type MetadataMapFactory = Box<dyn Fn() -> Box<dyn MetadataMap> + Send + Sync>;

type AddFn = dyn Fn(&str, &Value) -> Result<Option<Metadata>, OpError> + Send + Sync;
type DeleteFn = dyn Fn(&str, &Value, Option<&Metadata>) -> Result<(), OpError> + Send + Sync;
type ModifyFn =
    dyn Fn(&str, &Value, &Value, Option<&Metadata>) -> Result<Option<Metadata>, OpError>
        + Send
        + Sync;
type RecreateFn = dyn Fn(&str, &Value, &Value, Option<&Metadata>) -> bool + Send + Sync;
type UpdateFn = dyn Fn(&str, &Value, Option<&Metadata>) -> Result<(), OpError> + Send + Sync;
type RetriableFn = dyn Fn(&OpError) -> bool + Send + Sync;
type ComparatorFn = dyn Fn(&str, &Value, &Value) -> bool + Send + Sync;
type KeyLabelFn = dyn Fn(&str) -> String + Send + Sync;
type DependenciesFn = dyn Fn(&str, &Value) -> Vec<Dependency> + Send + Sync;
type DerivedValuesFn = dyn Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync;
type DumpFn = dyn Fn(&[KVWithMetadata]) -> Result<Vec<KVWithMetadata>, OpError> + Send + Sync;

/// Untyped descriptor record registered with the scheduler.
///
/// Only `name` and `key_selector` are mandatory; every other capability is
/// optional and defaulted by the handler. Use [`TypedKVDescriptor`] to write
/// callbacks against the concrete value type.
pub struct KVDescriptor {
    /// Unique descriptor name.
    pub name: String,
    /// Selects the keys this descriptor is responsible for. Selectors of
    /// registered descriptors must be disjoint; the first match (in
    /// registration order) wins.
    pub key_selector: KeySelector,
    /// Name of the concrete value type, used in error messages.
    pub value_type_name: String,
    /// Prefix under which NB declares values for this descriptor; used to
    /// scope NB resyncs.
    pub nb_key_prefix: Option<String>,
    /// Maps a key to a short display label. Defaults to the key itself.
    pub key_label: Option<Box<KeyLabelFn>>,
    /// Equivalence override; defaults to downcast + `PartialEq`.
    pub value_comparator: Option<Box<ComparatorFn>>,
    /// Whether applied values of this descriptor carry metadata.
    pub with_metadata: bool,
    /// Factory for the descriptor-local metadata map; defaults to
    /// [`DefaultMetadataMap`].
    pub metadata_map_factory: Option<MetadataMapFactory>,
    /// Applies a new value southbound, returning its metadata.
    pub add: Option<Box<AddFn>>,
    /// Removes an applied value southbound.
    pub delete: Option<Box<DeleteFn>>,
    /// Modifies an applied value in place. Absent ⇒ every change is applied
    /// as delete + add.
    pub modify: Option<Box<ModifyFn>>,
    /// Decides per change whether modification requires re-creation.
    pub modify_with_recreate: Option<Box<RecreateFn>>,
    /// Reacts to a change of a dependency while the value stays applied.
    pub update: Option<Box<UpdateFn>>,
    /// Classifies an operation error as retriable. Defaults to true.
    pub is_retriable_failure: Option<Box<RetriableFn>>,
    /// Dependencies of a value.
    pub dependencies: Option<Box<DependenciesFn>>,
    /// Values derived from a value, lifecycle-bound to it.
    pub derived_values: Option<Box<DerivedValuesFn>>,
    /// Dumps the SB view of all values owned by this descriptor.
    pub dump: Option<Box<DumpFn>>,
    /// Names of descriptors whose dumps must happen before this one.
    pub dump_dependencies: Vec<String>,
}

impl fmt::Debug for KVDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KVDescriptor")
            .field("name", &self.name)
            .field("value_type_name", &self.value_type_name)
            .field("nb_key_prefix", &self.nb_key_prefix)
            .field("with_metadata", &self.with_metadata)
            .field("dump_dependencies", &self.dump_dependencies)
            .finish()
    }
}

impl KVDescriptor {
    /// Creates a descriptor with just the mandatory attributes.
    pub fn new(
        name: impl Into<String>,
        key_selector: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        KVDescriptor {
            name: name.into(),
            key_selector: Arc::new(key_selector),
            value_type_name: String::new(),
            nb_key_prefix: None,
            key_label: None,
            value_comparator: None,
            with_metadata: false,
            metadata_map_factory: None,
            add: None,
            delete: None,
            modify: None,
            modify_with_recreate: None,
            update: None,
            is_retriable_failure: None,
            dependencies: None,
            derived_values: None,
            dump: None,
            dump_dependencies: Vec::new(),
        }
    }
}

/// Downcasts a type-erased value to the descriptor's concrete type.
pub fn downcast_value<'a, V: 'static>(key: &str, value: &'a Value) -> Result<&'a V, OpError> {
    value.as_any().downcast_ref::<V>().ok_or_else(|| {
        KvError::InvalidValueType {
            key: key.to_string(),
            expected: std::any::type_name::<V>(),
        }
        .into_op_error()
    })
}

/// Downcasts type-erased metadata to the descriptor's concrete type.
pub fn downcast_metadata<'a, M: 'static>(key: &str, metadata: &'a Metadata) -> Result<&'a M, OpError> {
    metadata.downcast_ref::<M>().ok_or_else(|| {
        KvError::InvalidMetadataType {
            key: key.to_string(),
        }
        .into_op_error()
    })
}

type TypedAddFn<V> = dyn Fn(&str, &V) -> Result<Option<Metadata>, OpError> + Send + Sync;
type TypedDeleteFn<V> = dyn Fn(&str, &V, Option<&Metadata>) -> Result<(), OpError> + Send + Sync;
type TypedModifyFn<V> =
    dyn Fn(&str, &V, &V, Option<&Metadata>) -> Result<Option<Metadata>, OpError> + Send + Sync;
type TypedRecreateFn<V> = dyn Fn(&str, &V, &V, Option<&Metadata>) -> bool + Send + Sync;
type TypedUpdateFn<V> = dyn Fn(&str, &V, Option<&Metadata>) -> Result<(), OpError> + Send + Sync;
type TypedComparatorFn<V> = dyn Fn(&str, &V, &V) -> bool + Send + Sync;
type TypedDependenciesFn<V> = dyn Fn(&str, &V) -> Vec<Dependency> + Send + Sync;
type TypedDerivedValuesFn<V> = dyn Fn(&str, &V) -> Vec<KeyValuePair> + Send + Sync;

/// Type-safe descriptor: callbacks receive the concrete value type `V` and
/// the adapter takes care of downcasting, surfacing mismatches as
/// [`KvError::InvalidValueType`].
pub struct TypedKVDescriptor<V> {
    inner: KVDescriptor,
    _marker: std::marker::PhantomData<fn(V)>,
}

impl<V> TypedKVDescriptor<V>
where
    V: 'static,
{
    /// Creates a typed descriptor with the mandatory attributes.
    pub fn new(
        name: impl Into<String>,
        key_selector: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        let mut inner = KVDescriptor::new(name, key_selector);
        inner.value_type_name = std::any::type_name::<V>().to_string();
        TypedKVDescriptor {
            inner,
            _marker: std::marker::PhantomData,
        }
    }

    /// Sets the NB key prefix used to scope resyncs.
    pub fn nb_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inner.nb_key_prefix = Some(prefix.into());
        self
    }

    /// Sets the key -> label mapping.
    pub fn key_label(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.inner.key_label = Some(Box::new(f));
        self
    }

    /// Overrides value equivalence.
    pub fn value_comparator(
        self,
        f: impl Fn(&str, &V, &V) -> bool + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedComparatorFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.value_comparator = Some(Box::new(move |key, old, new| {
                match (downcast_value::<V>(key, old), downcast_value::<V>(key, new)) {
                    (Ok(old), Ok(new)) => f(key, old, new),
                    _ => false,
                }
            }));
        })
    }

    /// Declares that applied values carry metadata.
    pub fn with_metadata(mut self) -> Self {
        self.inner.with_metadata = true;
        self
    }

    /// Supplies the metadata map factory (implies `with_metadata`).
    pub fn metadata_map_factory(mut self, f: MetadataMapFactory) -> Self {
        self.inner.with_metadata = true;
        self.inner.metadata_map_factory = Some(f);
        self
    }

    /// Sets the add callback.
    pub fn add(
        self,
        f: impl Fn(&str, &V) -> Result<Option<Metadata>, OpError> + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedAddFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.add = Some(Box::new(move |key, value| {
                f(key, downcast_value::<V>(key, value)?)
            }));
        })
    }

    /// Sets the delete callback.
    pub fn delete(
        self,
        f: impl Fn(&str, &V, Option<&Metadata>) -> Result<(), OpError> + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedDeleteFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.delete = Some(Box::new(move |key, value, metadata| {
                f(key, downcast_value::<V>(key, value)?, metadata)
            }));
        })
    }

    /// Sets the modify callback.
    pub fn modify(
        self,
        f: impl Fn(&str, &V, &V, Option<&Metadata>) -> Result<Option<Metadata>, OpError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let f: Box<TypedModifyFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.modify = Some(Box::new(move |key, old, new, metadata| {
                f(
                    key,
                    downcast_value::<V>(key, old)?,
                    downcast_value::<V>(key, new)?,
                    metadata,
                )
            }));
        })
    }

    /// Sets the modify-with-recreate decision callback.
    pub fn modify_with_recreate(
        self,
        f: impl Fn(&str, &V, &V, Option<&Metadata>) -> bool + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedRecreateFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.modify_with_recreate = Some(Box::new(move |key, old, new, metadata| {
                match (downcast_value::<V>(key, old), downcast_value::<V>(key, new)) {
                    (Ok(old), Ok(new)) => f(key, old, new, metadata),
                    _ => true,
                }
            }));
        })
    }

    /// Sets the update callback.
    pub fn update(
        self,
        f: impl Fn(&str, &V, Option<&Metadata>) -> Result<(), OpError> + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedUpdateFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.update = Some(Box::new(move |key, value, metadata| {
                f(key, downcast_value::<V>(key, value)?, metadata)
            }));
        })
    }

    /// Sets the retriability classifier.
    pub fn is_retriable_failure(
        mut self,
        f: impl Fn(&OpError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.inner.is_retriable_failure = Some(Box::new(f));
        self
    }

    /// Sets the dependencies callback.
    pub fn dependencies(
        self,
        f: impl Fn(&str, &V) -> Vec<Dependency> + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedDependenciesFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.dependencies = Some(Box::new(move |key, value| {
                match downcast_value::<V>(key, value) {
                    Ok(value) => f(key, value),
                    Err(_) => Vec::new(),
                }
            }));
        })
    }

    /// Sets the derived-values callback.
    pub fn derived_values(
        self,
        f: impl Fn(&str, &V) -> Vec<KeyValuePair> + Send + Sync + 'static,
    ) -> Self {
        let f: Box<TypedDerivedValuesFn<V>> = Box::new(f);
        self.map_inner(move |inner| {
            inner.derived_values = Some(Box::new(move |key, value| {
                match downcast_value::<V>(key, value) {
                    Ok(value) => f(key, value),
                    Err(_) => Vec::new(),
                }
            }));
        })
    }

    /// Sets the SB dump callback.
    pub fn dump(
        mut self,
        f: impl Fn(&[KVWithMetadata]) -> Result<Vec<KVWithMetadata>, OpError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.inner.dump = Some(Box::new(f));
        self
    }

    /// Declares descriptors whose dumps must run before this one.
    pub fn dump_dependencies(mut self, names: Vec<String>) -> Self {
        self.inner.dump_dependencies = names;
        self
    }

    /// Finishes the build, yielding the untyped record for registration.
    pub fn build(self) -> KVDescriptor {
        self.inner
    }

    fn map_inner(mut self, f: impl FnOnce(&mut KVDescriptor)) -> Self {
        f(&mut self.inner);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;

    #[test]
    fn typed_adapter_reports_value_type_mismatch() {
        let descriptor = TypedKVDescriptor::<String>::new("strings", |key| key.starts_with("s/"))
            .add(|_, _| Ok(None))
            .build();
        let add = descriptor.add.as_ref().unwrap();

        assert!(add("s/ok", &value(String::from("fine"))).is_ok());
        let err = add("s/bad", &value(7u8)).unwrap_err();
        assert!(err.to_string().contains("unexpected type"));
    }

    #[test]
    fn dependency_constructors() {
        let dep = Dependency::on_key("iface", "if/eth0");
        match dep.target {
            DependencyTarget::Key(ref key) => assert_eq!(key, "if/eth0"),
            _ => panic!("expected concrete key"),
        }
        let dep = Dependency::any_of("any-route", |key| key.starts_with("route/"));
        match dep.target {
            DependencyTarget::AnyOf(ref selector) => assert!(selector("route/10.0.0.0/24")),
            _ => panic!("expected selector"),
        }
    }
}
