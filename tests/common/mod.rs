//! Shared test harness: a programmable toy descriptor over the `d/` key
//! prefix, backed by a recording mock of the southbound agent.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kvflow::{
    metadata, value, Dependency, KVDescriptor, KVWithMetadata, KeyValuePair, KvScheduler, OpError,
    SchedulerConfig, TypedKVDescriptor, ValueOrigin,
};

pub const DESCRIPTOR: &str = "test-descriptor";

/// Value schema of the toy descriptor: a label, dependency keys and keys of
/// derived values.
#[derive(Clone, Debug, PartialEq)]
pub struct TestValue {
    pub label: String,
    pub deps: Vec<String>,
    pub derives: Vec<String>,
}

pub fn val(label: &str) -> kvflow::Value {
    value(TestValue {
        label: label.to_string(),
        deps: Vec::new(),
        derives: Vec::new(),
    })
}

pub fn val_dep(label: &str, deps: &[&str]) -> kvflow::Value {
    value(TestValue {
        label: label.to_string(),
        deps: deps.iter().map(|d| d.to_string()).collect(),
        derives: Vec::new(),
    })
}

pub fn val_der(label: &str, derives: &[&str]) -> kvflow::Value {
    value(TestValue {
        label: label.to_string(),
        deps: Vec::new(),
        derives: derives.iter().map(|d| d.to_string()).collect(),
    })
}

pub fn as_test_value(v: &kvflow::Value) -> TestValue {
    v.as_any()
        .downcast_ref::<TestValue>()
        .expect("test value")
        .clone()
}

/// Error returned by the mock SB agent.
#[derive(Clone, Debug)]
pub struct SbError {
    pub msg: String,
    pub retriable: bool,
}

impl fmt::Display for SbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for SbError {}

/// One recorded SB call.
#[derive(Clone, Debug)]
pub struct SbCall {
    pub op: &'static str,
    pub key: String,
    pub at: Instant,
}

/// Recording mock of the southbound agent, with programmable failures and a
/// dumpable state.
#[derive(Default)]
pub struct MockSb {
    calls: Mutex<Vec<SbCall>>,
    failures: Mutex<HashMap<(&'static str, String), (SbError, Option<usize>)>>,
    state: Mutex<HashMap<String, TestValue>>,
    latency: Mutex<Option<std::time::Duration>>,
}

impl MockSb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every `op` on `key` fail until the failure is cleared.
    pub fn fail_on(&self, op: &'static str, key: &str, msg: &str, retriable: bool) {
        self.failures.lock().unwrap().insert(
            (op, key.to_string()),
            (
                SbError {
                    msg: msg.to_string(),
                    retriable,
                },
                None,
            ),
        );
    }

    /// Makes the next `times` invocations of `op` on `key` fail. Zero
    /// times is a no-op.
    pub fn fail_times(&self, op: &'static str, key: &str, msg: &str, retriable: bool, times: usize) {
        if times == 0 {
            return;
        }
        self.failures.lock().unwrap().insert(
            (op, key.to_string()),
            (
                SbError {
                    msg: msg.to_string(),
                    retriable,
                },
                Some(times),
            ),
        );
    }

    pub fn clear_failure(&self, op: &'static str, key: &str) {
        self.failures.lock().unwrap().remove(&(op, key.to_string()));
    }

    /// Overwrites the SB-side state of a key (visible to `dump`).
    pub fn seed_state(&self, key: &str, value: TestValue) {
        self.state.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn state_of(&self, key: &str) -> Option<TestValue> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn calls(&self) -> Vec<SbCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &'static str, key: &str) -> Vec<SbCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.op == op && call.key == key)
            .collect()
    }

    pub fn count(&self, op: &'static str, key: &str) -> usize {
        self.calls_for(op, key).len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Every SB call sleeps for the given duration (to simulate slow I/O).
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    fn record(&self, op: &'static str, key: &str) -> Result<(), OpError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        self.calls.lock().unwrap().push(SbCall {
            op,
            key: key.to_string(),
            at: Instant::now(),
        });
        let mut failures = self.failures.lock().unwrap();
        let entry = (op, key.to_string());
        if let Some((err, remaining)) = failures.get_mut(&entry) {
            let err = err.clone();
            // entries always hold remaining >= 1; fail_times rejects zero
            if let Some(times) = remaining {
                *times -= 1;
                if *times == 0 {
                    failures.remove(&entry);
                }
            }
            return Err(Arc::new(err) as OpError);
        }
        Ok(())
    }
}

/// Key -> value overrides for derived children (lets tests build derivation
/// chains and cycles).
#[derive(Default)]
pub struct DerivationPlan {
    children: Mutex<HashMap<String, TestValue>>,
}

impl DerivationPlan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &str, value: TestValue) {
        self.children.lock().unwrap().insert(key.to_string(), value);
    }

    fn value_for(&self, key: &str) -> TestValue {
        self.children
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| TestValue {
                label: key.to_string(),
                deps: Vec::new(),
                derives: Vec::new(),
            })
    }
}

/// Options of the toy descriptor.
#[derive(Clone, Default)]
pub struct DescriptorOptions {
    pub recreate_on_modify: bool,
    pub with_metadata: bool,
    pub with_dump: bool,
}

/// Builds the toy descriptor on keys with the `d/` prefix.
pub fn test_descriptor(
    sb: Arc<MockSb>,
    plan: Arc<DerivationPlan>,
    options: DescriptorOptions,
) -> KVDescriptor {
    let recreate = options.recreate_on_modify;
    let mut descriptor = TypedKVDescriptor::<TestValue>::new(DESCRIPTOR, |key| {
        key.starts_with("d/")
    })
    .nb_key_prefix("d/")
    .key_label(|key| key.trim_start_matches("d/").to_string())
    .add({
        let sb = sb.clone();
        let with_metadata = options.with_metadata;
        move |key, v| {
            sb.record("add", key)?;
            sb.state.lock().unwrap().insert(key.to_string(), v.clone());
            if with_metadata {
                Ok(Some(metadata(v.label.clone())))
            } else {
                Ok(None)
            }
        }
    })
    .delete({
        let sb = sb.clone();
        move |key, _v, _metadata| {
            sb.record("delete", key)?;
            sb.state.lock().unwrap().remove(key);
            Ok(())
        }
    })
    .modify({
        let sb = sb.clone();
        move |key, _old, new, metadata| {
            sb.record("modify", key)?;
            sb.state.lock().unwrap().insert(key.to_string(), new.clone());
            Ok(metadata.cloned())
        }
    })
    .update({
        let sb = sb.clone();
        move |key, _v, _metadata| sb.record("update", key)
    })
    .modify_with_recreate(move |_key, _old, _new, _metadata| recreate)
    .is_retriable_failure(|err| {
        err.downcast_ref::<SbError>()
            .map(|sb_err| sb_err.retriable)
            .unwrap_or(true)
    })
    .dependencies(|_key, v| {
        v.deps
            .iter()
            .map(|dep| Dependency::on_key(dep.clone(), dep.clone()))
            .collect()
    })
    .derived_values({
        let plan = plan.clone();
        move |_key, v| {
            v.derives
                .iter()
                .map(|child| KeyValuePair {
                    key: child.clone(),
                    value: value(plan.value_for(child)),
                })
                .collect()
        }
    });

    if options.with_metadata {
        descriptor = descriptor.with_metadata();
    }
    if options.with_dump {
        let sb = sb.clone();
        descriptor = descriptor.dump(move |_correlate| {
            let state = sb.state.lock().unwrap();
            let mut dumped: Vec<KVWithMetadata> = state
                .iter()
                .map(|(key, v)| KVWithMetadata {
                    key: key.clone(),
                    value: value(v.clone()),
                    metadata: None,
                    origin: ValueOrigin::FromNB,
                })
                .collect();
            dumped.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(dumped)
        });
    }
    descriptor.build()
}

/// A scheduler wired to a fresh mock SB and derivation plan.
pub struct TestScheduler {
    pub scheduler: KvScheduler,
    pub sb: Arc<MockSb>,
    pub plan: Arc<DerivationPlan>,
}

pub fn start(options: DescriptorOptions) -> TestScheduler {
    let _ = env_logger::builder().is_test(true).try_init();
    let sb = MockSb::new();
    let plan = DerivationPlan::new();
    let scheduler = KvScheduler::start(SchedulerConfig::default());
    scheduler.register_descriptor(test_descriptor(sb.clone(), plan.clone(), options));
    TestScheduler {
        scheduler,
        sb,
        plan,
    }
}

/// Shorthand: the `(key, operation)` pairs of a recorded op stream.
pub fn op_keys(txn: &kvflow::RecordedTxn) -> Vec<(String, kvflow::TxnOperation)> {
    txn.ops
        .iter()
        .map(|op| (op.key.clone(), op.operation))
        .collect()
}
