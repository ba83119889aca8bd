//! Randomized stress test: a mutator thread commits random transactions
//! while reader threads query the scheduler, and the graph invariants are
//! checked at the end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kvflow::{KvScheduler, NbTransaction, SchedulerConfig};
use rand::seq::SliceRandom;
use rand::Rng;

const N_KEYS: usize = 8;
const N_MUTATOR_OPS: usize = 150;
const N_READER_OPS: usize = 50;

fn key(index: usize) -> String {
    format!("d/k{}", index)
}

#[derive(Clone, Debug)]
enum MutatorOp {
    Set { key: usize, deps: Vec<usize> },
    Delete { key: usize },
    LaunchReader,
}

impl rand::distributions::Distribution<MutatorOp> for rand::distributions::Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> MutatorOp {
        let roll = rng.gen_range(0..10);
        if roll < 6 {
            let key = rng.gen_range(0..N_KEYS);
            let mut candidates: Vec<usize> = (0..N_KEYS).filter(|k| *k != key).collect();
            candidates.shuffle(rng);
            let deps = candidates
                .into_iter()
                .take(rng.gen_range(0..3))
                .collect();
            MutatorOp::Set { key, deps }
        } else if roll < 9 {
            MutatorOp::Delete {
                key: rng.gen_range(0..N_KEYS),
            }
        } else {
            MutatorOp::LaunchReader
        }
    }
}

fn reader_thread(scheduler: &KvScheduler) {
    for _ in 0..N_READER_OPS {
        let _ = scheduler.get_values(|key| key.starts_with("d/"));
        let _ = scheduler.get_pending_values();
        let _ = scheduler.get_failed_values();
    }
}

#[test]
fn stress_test() {
    let _ = env_logger::builder().is_test(true).try_init();
    let sb = MockSb::new();
    let plan = DerivationPlan::new();
    let scheduler = Arc::new(KvScheduler::start(SchedulerConfig::default()));
    scheduler.register_descriptor(test_descriptor(
        sb.clone(),
        plan,
        DescriptorOptions::default(),
    ));

    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    scheduler.subscribe(status_tx, Arc::new(|key: &str| key.starts_with("d/")));
    let drain = std::thread::spawn(move || while status_rx.recv().is_ok() {});

    let mut rng = rand::thread_rng();
    let ops: Vec<MutatorOp> = (0..N_MUTATOR_OPS).map(|_| rng.gen()).collect();

    let mut readers = Vec::new();
    for op in ops {
        match op {
            MutatorOp::Set { key: k, deps } => {
                let deps: Vec<String> = deps.into_iter().map(key).collect();
                let dep_refs: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                let result = scheduler
                    .commit(NbTransaction::new().set_value(key(k), val_dep("v", &dep_refs)))
                    .unwrap();
                assert!(result.error.is_none());
            }
            MutatorOp::Delete { key: k } => {
                let result = scheduler
                    .commit(NbTransaction::new().delete_value(key(k)))
                    .unwrap();
                assert!(result.error.is_none());
            }
            MutatorOp::LaunchReader => {
                let scheduler = scheduler.clone();
                readers.push(std::thread::spawn(move || reader_thread(&scheduler)));
            }
        }
    }

    for reader in readers {
        reader.join().unwrap();
    }

    // settled graph: every applied value has all dependencies applied,
    // every pending value misses at least one
    let pending: Vec<String> = scheduler
        .get_pending_values()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    let applied: Vec<_> = scheduler
        .get_values(|key| key.starts_with("d/"))
        .into_iter()
        .filter(|kv| !pending.contains(&kv.key))
        .collect();
    for kv in &applied {
        for dep in &as_test_value(&kv.value).deps {
            assert!(
                scheduler.get_value(dep).is_some() && !pending.contains(dep),
                "applied {} has unsatisfied dependency {}",
                kv.key,
                dep
            );
        }
    }
    for key in &pending {
        let value = scheduler
            .get_values(|k| k == key.as_str())
            .into_iter()
            .next()
            .expect("pending value present in graph");
        let unsatisfied = as_test_value(&value.value)
            .deps
            .iter()
            .any(|dep| scheduler.get_value(dep).is_none() || pending.contains(dep));
        assert!(unsatisfied, "pending {} has all dependencies satisfied", key);
    }

    // sequence numbers stayed strictly increasing across the whole run
    let history = scheduler.transaction_history();
    for pair in history.windows(2) {
        assert!(pair[0].seq_num < pair[1].seq_num);
    }

    scheduler.close();
    std::thread::sleep(Duration::from_millis(10));
    drop(scheduler);
    drain.join().unwrap();
}
