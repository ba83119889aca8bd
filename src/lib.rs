#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The kvflow crate is a transactional key-value configuration scheduler.
//! It sits between a northbound source of desired configuration and a
//! southbound stateful agent: northbound intents arrive as transactions,
//! are reconciled against an in-memory dependency graph of declared values,
//! and are carried out as an ordered sequence of add/modify/delete/update
//! operations dispatched to per-key descriptors. Unsatisfied dependencies
//! park values as pending, failures can be retried or atomically reverted,
//! and every transaction leaves behind a compressed record of the
//! operations it executed.

mod error;
mod exec;
mod handler;
mod notify;
mod queue;
mod refresh;
mod registry;
mod scheduler;
mod txn;

pub mod descriptor;
pub mod graph;
pub mod keyset;
pub mod value;

pub use crate::descriptor::{
    downcast_metadata, downcast_value, DefaultMetadataMap, Dependency, DependencyTarget,
    KVDescriptor, KVWithMetadata, KeySelector, KeyValuePair, MetadataMap, MetadataMapFactory,
    TypedKVDescriptor,
};
pub use crate::error::{KvError, OpError};
pub use crate::keyset::KeySet;
pub use crate::notify::{BaseValueStatus, ValueState};
pub use crate::registry::DescriptorRegistry;
pub use crate::scheduler::{KvScheduler, SchedulerConfig};
pub use crate::txn::{
    NbTransaction, RecordedTxn, RecordedTxnOp, ResyncType, TxnOperation, TxnResult,
};
pub use crate::value::{metadata, value, AnyValue, Metadata, Value, ValueOrigin};
