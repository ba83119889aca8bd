//! Type-erased configuration values.
//!
//! The scheduler core is untyped: every value travels as `Arc<dyn AnyValue>`
//! and only the owning descriptor knows (and checks) the concrete type.
//! Typed descriptor adapters recover the concrete type with
//! [`downcast_value`] and surface a mismatch as
//! [`InvalidValueType`](crate::KvError::InvalidValueType).

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A configuration value as seen by the scheduler core.
///
/// The schema of a value is owned by its descriptor; the core only needs the
/// value to be printable, shareable across threads and comparable for
/// equivalence. Any `'static` type that is `Debug + PartialEq + Send + Sync`
/// implements this trait automatically.
pub trait AnyValue: Any + Debug + Send + Sync {
    /// Name of the concrete value type, used in error messages.
    fn type_name(&self) -> &'static str;

    /// Upcast for downcasting in typed adapters.
    fn as_any(&self) -> &dyn Any;

    /// Default equivalence: the two values have the same concrete type and
    /// compare equal. Descriptors may override comparison per key with
    /// `value_comparator`.
    fn equivalent(&self, other: &dyn AnyValue) -> bool;
}

impl<T> AnyValue for T
where
    T: Any + Debug + PartialEq + Send + Sync,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equivalent(&self, other: &dyn AnyValue) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// Shared handle to a configuration value. `None` in the places where values
/// are optional means "intent: absent".
pub type Value = Arc<dyn AnyValue>;

/// Opaque descriptor-produced metadata attached to an applied value.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Wraps a concrete value into the type-erased handle used by the scheduler.
pub fn value<T>(value: T) -> Value
where
    T: Any + Debug + PartialEq + Send + Sync,
{
    Arc::new(value)
}

/// Wraps concrete metadata into the type-erased handle stored on nodes.
pub fn metadata<T>(metadata: T) -> Metadata
where
    T: Any + Send + Sync,
{
    Arc::new(metadata)
}

/// Where a value originated from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueOrigin {
    /// Declared intent received from the northbound API.
    FromNB,
    /// Observed fact notified by the southbound agent.
    FromSB,
    /// Not yet determined (e.g. a node seen only as a dependency slot).
    Unknown,
}

impl Default for ValueOrigin {
    fn default() -> Self {
        ValueOrigin::Unknown
    }
}
