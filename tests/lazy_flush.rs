mod common;

use common::entities::{Account, PersonRef};
use common::prepare;
use std::cell::Cell;
use std::rc::Rc;
use stratum::driver::QueueClient;
use stratum::{DbValue, Entity, LazyReceiver, OrmError, Ref, Where};

fn account_harness() -> common::Harness {
    prepare(|registry| {
        registry.register_entity(Account::descriptor());
        registry.register_entity(PersonRef::descriptor());
    })
}

#[test]
fn lazy_flush_defers_sql_to_the_receiver() {
    let harness = account_harness();
    let mut engine = harness.engine();
    harness.db.clear_statements();

    let account = engine
        .track_new(Account {
            name: "John".to_string(),
            age: 18,
            ..Account::default()
        })
        .unwrap();
    engine.flush_lazy().unwrap();

    // Nothing touched the database yet; the plan sits in the queue.
    assert_eq!(harness.db.statements_matching("INSERT"), 0);
    assert_eq!(harness.queue.len("orm_lazy").unwrap(), 1);
    assert_eq!(account.borrow().id, 0);
    assert!(engine.load_by_id::<Account>(1, &[]).unwrap().is_none());

    let mut receiver = LazyReceiver::new(harness.engine());
    receiver.disable_loop();
    let beat = Rc::new(Cell::new(false));
    let seen = Rc::clone(&beat);
    receiver.set_heartbeat(move || seen.set(true));
    receiver.digest().unwrap();
    assert!(beat.get());

    // The replay landed the row and evicted the negative sentinel.
    let loaded = engine.load_by_id::<Account>(1, &[]).unwrap().unwrap();
    assert_eq!(loaded.borrow().name, "John");
    assert_eq!(loaded.borrow().age, 18);
}

#[test]
fn lazy_updates_and_deletes_replay_in_order() {
    let harness = account_harness();
    let mut engine = harness.engine();

    let account = engine
        .track_new(Account {
            name: "John".to_string(),
            age: 18,
            ..Account::default()
        })
        .unwrap();
    engine.flush().unwrap();

    engine.track(&account).unwrap();
    account.borrow_mut().name = "Tom".to_string();
    engine.flush_lazy().unwrap();

    let mut receiver = LazyReceiver::new(harness.engine());
    receiver.disable_loop();
    receiver.digest().unwrap();

    let loaded = engine.load_by_id::<Account>(1, &[]).unwrap().unwrap();
    assert_eq!(loaded.borrow().name, "Tom");

    engine.mark_to_delete(&account).unwrap();
    engine.flush_lazy().unwrap();
    receiver.digest().unwrap();

    assert!(engine.load_by_id::<Account>(1, &[]).unwrap().is_none());
    assert_eq!(harness.db.row_count("Account"), 0);
}

#[test]
fn unsaved_references_are_rejected_and_leave_the_tracked_set() {
    let harness = account_harness();
    let mut engine = harness.engine();

    let reference = Rc::new(std::cell::RefCell::new(PersonRef {
        name: "unsaved".to_string(),
        ..PersonRef::default()
    }));
    engine
        .track_new(Account {
            name: "Adam".to_string(),
            ref_one: Ref::to(&reference),
            ..Account::default()
        })
        .unwrap();

    let err = engine.flush_lazy().unwrap_err();
    match err {
        OrmError::NotSupported(message) => {
            assert_eq!(message, "lazy flush for unsaved references not supported");
        }
        other => panic!("expected not-supported error, got {other:?}"),
    }
    assert_eq!(engine.tracked_count(), 1);
    engine.clear_tracked_entities();
    assert_eq!(harness.queue.len("orm_lazy").unwrap(), 0);
}

#[test]
fn on_duplicate_key_update_is_rejected() {
    let harness = account_harness();
    let mut engine = harness.engine();

    let account = engine
        .track_new(Account {
            name: "Tom".to_string(),
            ..Account::default()
        })
        .unwrap();
    engine
        .set_on_duplicate_key_update(Where::new("`Age` = ?", vec![DbValue::Uint(38)]), &account)
        .unwrap();

    let err = engine.flush_lazy().unwrap_err();
    match err {
        OrmError::NotSupported(message) => {
            assert_eq!(message, "lazy flush on duplicate key not supported");
        }
        other => panic!("expected not-supported error, got {other:?}"),
    }
    assert_eq!(engine.tracked_count(), 1);
    assert_eq!(harness.queue.len("orm_lazy").unwrap(), 0);
}

#[test]
fn a_bad_record_never_wedges_the_loop() {
    let harness = account_harness();
    let mut engine = harness.engine();

    harness
        .queue
        .push("orm_lazy", b"this is not a plan")
        .unwrap();

    engine
        .track_new(Account {
            name: "survivor".to_string(),
            ..Account::default()
        })
        .unwrap();
    engine.flush_lazy().unwrap();

    let mut receiver = LazyReceiver::new(harness.engine());
    receiver.disable_loop();
    receiver.digest().unwrap();

    // The garbage record was dropped, the real plan replayed.
    assert_eq!(harness.queue.len("orm_lazy").unwrap(), 0);
    assert_eq!(harness.db.row_count("Account"), 1);
}

#[test]
fn failing_plans_retire_after_the_retry_budget() {
    let harness = account_harness();

    // A structurally valid plan against a table that does not exist.
    let plan = serde_json::json!({
        "attempts": 0,
        "sql": [{"pool": "default", "sql": "DELETE FROM `Missing` WHERE `ID` IN (?)",
                 "params": [{"Uint": 1}]}],
        "local_invalidate": [],
        "kv_invalidate": [],
        "dirty": [],
        "log": []
    });
    harness
        .queue
        .push("orm_lazy", plan.to_string().as_bytes())
        .unwrap();

    let mut receiver = LazyReceiver::new(harness.engine());
    receiver.disable_loop();
    receiver.digest().unwrap();

    // Requeued twice, then dropped: the queue drains within one digest.
    assert_eq!(harness.queue.len("orm_lazy").unwrap(), 0);
}
