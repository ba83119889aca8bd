//! Resync modes and queue behavior.

mod common;

use std::time::Duration;

use common::*;
use kvflow::{
    KvError, KvScheduler, NbTransaction, ResyncType, SchedulerConfig, TxnOperation,
};

#[test]
fn full_resync_deletes_values_not_reasserted() {
    let t = start(DescriptorOptions::default());
    t.scheduler
        .commit(
            NbTransaction::new()
                .set_value("d/a", val("a"))
                .set_value("d/b", val("b")),
        )
        .unwrap();

    let result = t
        .scheduler
        .commit(
            NbTransaction::new()
                .set_value("d/a", val("a"))
                .with_resync(ResyncType::Full),
        )
        .unwrap();
    assert!(result.error.is_none());

    assert!(t.scheduler.get_value("d/a").is_some());
    assert!(t.scheduler.get_value("d/b").is_none());
    assert_eq!(t.sb.count("delete", "d/b"), 1);
    assert_eq!(t.sb.count("modify", "d/a"), 0);

    let history = t.scheduler.transaction_history();
    assert_eq!(
        op_keys(history.last().unwrap()),
        vec![("d/b".to_string(), TxnOperation::Delete)]
    );
}

#[test]
fn upstream_resync_removes_sb_drift() {
    let t = start(DescriptorOptions {
        with_dump: true,
        ..DescriptorOptions::default()
    });
    t.scheduler
        .commit(NbTransaction::new().set_value("d/a", val("a")))
        .unwrap();

    // a value exists southbound that NB never declared
    t.sb.seed_state(
        "d/x",
        TestValue {
            label: "drift".to_string(),
            deps: vec![],
            derives: vec![],
        },
    );

    let result = t
        .scheduler
        .commit(
            NbTransaction::new()
                .set_value("d/a", val("a"))
                .with_resync(ResyncType::Upstream),
        )
        .unwrap();
    assert!(result.error.is_none());

    assert!(t.scheduler.get_value("d/a").is_some());
    assert!(t.scheduler.get_value("d/x").is_none());
    assert_eq!(t.sb.count("delete", "d/x"), 1);
    assert!(t.sb.state_of("d/x").is_none());
}

#[test]
fn downstream_resync_simulates_without_touching_sb() {
    let t = start(DescriptorOptions {
        with_dump: true,
        ..DescriptorOptions::default()
    });
    t.scheduler
        .commit(NbTransaction::new().set_value("d/a", val("v1")))
        .unwrap();

    // the device drifted behind NB's back
    t.sb.seed_state(
        "d/a",
        TestValue {
            label: "drifted".to_string(),
            deps: vec![],
            derives: vec![],
        },
    );
    let calls_before = t.sb.calls().len();

    let result = t
        .scheduler
        .commit(
            NbTransaction::new()
                .with_resync(ResyncType::Downstream)
                .with_verbose_refresh(),
        )
        .unwrap();
    assert!(result.error.is_none());

    // the op stream reports the correction that would be needed, but
    // nothing was pushed southbound and the graph keeps the SB view
    let history = t.scheduler.transaction_history();
    let ops = op_keys(history.last().unwrap());
    assert!(ops.contains(&("d/a".to_string(), TxnOperation::Modify)));
    assert_eq!(t.sb.calls().len(), calls_before);
    assert_eq!(
        as_test_value(&t.scheduler.get_value("d/a").unwrap()).label,
        "drifted"
    );
}

#[test]
fn queue_overflows_fail_fast_for_async_commits() {
    let _ = env_logger::builder().is_test(true).try_init();
    let sb = MockSb::new();
    sb.set_latency(Duration::from_millis(100));
    let plan = DerivationPlan::new();
    let scheduler = KvScheduler::start(SchedulerConfig { queue_capacity: 1 });
    scheduler.register_descriptor(test_descriptor(
        sb.clone(),
        plan,
        DescriptorOptions::default(),
    ));

    // first txn occupies the worker, second fills the queue slot
    scheduler
        .commit_async(NbTransaction::new().set_value("d/1", val("v")))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    scheduler
        .commit_async(NbTransaction::new().set_value("d/2", val("v")))
        .unwrap();

    let mut overflowed = false;
    for i in 3..10 {
        match scheduler.commit_async(
            NbTransaction::new().set_value(format!("d/{}", i), val("v")),
        ) {
            Err(KvError::TxnQueueFull) => {
                overflowed = true;
                break;
            }
            Ok(()) => continue,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert!(overflowed, "expected the queue to overflow");
}
