mod common;

use common::entities::{Account, Chain, Hooked, Person, PersonRef};
use common::prepare;
use std::rc::Rc;
use stratum::{DbValue, Entity, OrmError, Ref, Where};

#[test]
fn insert_assigns_ids_in_emission_order() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();
    harness.db.clear_statements();

    let mut people = Vec::new();
    for index in 1..=10 {
        let person = engine
            .track_new(Person {
                name: format!("Name {index}"),
                age: 10,
                ..Person::default()
            })
            .unwrap();
        people.push(person);
    }
    engine.flush().unwrap();

    for (index, person) in people.iter().enumerate() {
        assert_eq!(person.borrow().id, index as u64 + 1);
    }
    // One multi-row statement for the whole batch.
    assert_eq!(harness.db.statements_matching("INSERT INTO `Person`"), 1);
    assert_eq!(harness.db.row_count("Person"), 10);
}

#[test]
fn flush_of_a_clean_entity_is_a_no_op() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    let person = engine
        .track_new(Person {
            name: "John".to_string(),
            age: 18,
            ..Person::default()
        })
        .unwrap();
    engine.flush().unwrap();
    assert!(!engine.is_dirty(&*person.borrow()).unwrap());

    harness.db.clear_statements();
    let kv_keys = harness.kv.key_count();
    engine.track(&person).unwrap();
    engine.flush().unwrap();

    assert!(harness.db.statements().is_empty());
    assert_eq!(harness.kv.key_count(), kv_keys);
}

#[test]
fn updates_write_only_dirty_columns() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    let person = engine
        .track_new(Person {
            name: "John".to_string(),
            age: 18,
            ..Person::default()
        })
        .unwrap();
    engine.flush().unwrap();

    engine.track(&person).unwrap();
    person.borrow_mut().name = "Tom".to_string();
    harness.db.clear_statements();
    engine.flush().unwrap();

    let statements = harness.db.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0],
        "UPDATE `Person` SET `Name` = ? WHERE `ID` = ?"
    );
    assert_eq!(
        harness.db.row("Person", 1).unwrap()["Name"].canonical(),
        "Tom"
    );
}

#[test]
fn identical_update_binds_batch_by_id_list() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    let mut people = Vec::new();
    for index in 1..=3 {
        people.push(
            engine
                .track_new(Person {
                    name: format!("Name {index}"),
                    age: 10,
                    ..Person::default()
                })
                .unwrap(),
        );
    }
    engine.flush().unwrap();

    for person in &people {
        engine.track(person).unwrap();
    }
    people[0].borrow_mut().age = 30;
    people[1].borrow_mut().age = 30;
    people[2].borrow_mut().age = 40;
    harness.db.clear_statements();
    engine.flush().unwrap();

    let updates: Vec<String> = harness
        .db
        .statements()
        .into_iter()
        .filter(|sql| sql.starts_with("UPDATE"))
        .collect();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().any(|sql| sql.contains("IN (?,?)")));
}

#[test]
fn deletes_remove_rows_and_run_last() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    let first = engine
        .track_new(Person {
            name: "one".to_string(),
            ..Person::default()
        })
        .unwrap();
    let second = engine
        .track_new(Person {
            name: "two".to_string(),
            ..Person::default()
        })
        .unwrap();
    engine.flush().unwrap();

    engine.mark_to_delete(&first).unwrap();
    let third = engine
        .track_new(Person {
            name: "three".to_string(),
            ..Person::default()
        })
        .unwrap();
    harness.db.clear_statements();
    engine.flush().unwrap();

    let statements = harness.db.statements();
    assert!(statements[0].starts_with("INSERT"));
    assert!(statements.last().unwrap().starts_with("DELETE"));
    assert_eq!(harness.db.row_count("Person"), 2);
    assert_eq!(second.borrow().id, 2);
    assert_eq!(third.borrow().id, 3);

    let loaded = engine.load_by_id::<Person>(1, &[]).unwrap();
    assert!(loaded.is_none());

    // Still not found when the local tier is wiped: the remote sentinel
    // (and ultimately the database) agree.
    engine.local_cache("").unwrap().clear();
    let loaded = engine.load_by_id::<Person>(1, &[]).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn unsaved_references_flush_in_the_same_call() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    let reference = Rc::new(std::cell::RefCell::new(PersonRef {
        name: "target".to_string(),
        ..PersonRef::default()
    }));
    let person = engine
        .track_new(Person {
            name: "holder".to_string(),
            ref_one: Ref::to(&reference),
            ..Person::default()
        })
        .unwrap();
    engine.flush().unwrap();

    assert_ne!(reference.borrow().id, 0);
    assert_eq!(
        harness.db.row("Person", person.borrow().id).unwrap()["RefOne"].canonical(),
        reference.borrow().id.to_string()
    );
}

#[test]
fn reference_cycles_defer_the_fk_and_patch_it() {
    let harness = prepare(|registry| {
        registry.register_entity(Chain::descriptor());
    });
    let mut engine = harness.engine();

    let first = Rc::new(std::cell::RefCell::new(Chain {
        name: "a".to_string(),
        ..Chain::default()
    }));
    let second = Rc::new(std::cell::RefCell::new(Chain {
        name: "b".to_string(),
        ..Chain::default()
    }));
    first.borrow_mut().next = Ref::to(&second);
    second.borrow_mut().next = Ref::to(&first);

    engine.track(&first).unwrap();
    engine.track(&second).unwrap();
    harness.db.clear_statements();
    engine.flush().unwrap();

    let first_id = first.borrow().id;
    let second_id = second.borrow().id;
    assert_ne!(first_id, 0);
    assert_ne!(second_id, 0);
    assert_eq!(
        harness.db.row("Chain", first_id).unwrap()["Next"].canonical(),
        second_id.to_string()
    );
    assert_eq!(
        harness.db.row("Chain", second_id).unwrap()["Next"].canonical(),
        first_id.to_string()
    );
    // The deferred side lands via a patch UPDATE after both IDs exist.
    assert_eq!(harness.db.statements_matching("UPDATE `Chain`"), 1);
}

#[test]
fn lifecycle_hooks_fire_at_their_defined_points() {
    let harness = prepare(|registry| {
        registry.register_entity(Hooked::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    engine
        .track_new(PersonRef {
            name: "first".to_string(),
            ..PersonRef::default()
        })
        .unwrap();
    engine.flush().unwrap();

    let hooked = engine.track_new(Hooked::default()).unwrap();
    // set_defaults ran on first track.
    assert_eq!(hooked.borrow().uint, 3);
    assert_eq!(hooked.borrow().name, "hello");
    assert_eq!(hooked.borrow().ref_one.id(), 1);

    hooked.borrow_mut().uint = 5;
    engine.flush().unwrap();
    assert_eq!(hooked.borrow().calculated, 6);

    engine.track(&hooked).unwrap();
    hooked.borrow_mut().uint = 10;
    engine.flush().unwrap();
    assert_eq!(hooked.borrow().calculated, 11);

    engine.track(&hooked).unwrap();
    hooked.borrow_mut().name = "invalid".to_string();
    let err = engine.flush().unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
}

#[test]
fn on_duplicate_key_update_folds_into_the_existing_row() {
    let harness = prepare(|registry| {
        registry.register_entity(Account::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    engine
        .track_new(Account {
            name: "Tom".to_string(),
            age: 18,
            ..Account::default()
        })
        .unwrap();
    engine.flush().unwrap();

    let duplicate = engine
        .track_new(Account {
            name: "Tom".to_string(),
            ..Account::default()
        })
        .unwrap();
    engine
        .set_on_duplicate_key_update(
            Where::new("`Age` = ?", vec![DbValue::Uint(38)]),
            &duplicate,
        )
        .unwrap();
    engine.flush().unwrap();

    assert_eq!(duplicate.borrow().id, 1);
    assert_eq!(harness.db.row_count("Account"), 1);
    assert_eq!(
        harness.db.row("Account", 1).unwrap()["Age"].canonical(),
        "38"
    );
}

#[test]
fn duplicate_key_violations_surface_as_typed_errors() {
    let harness = prepare(|registry| {
        registry.register_entity(Account::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    engine
        .track_new(Account {
            name: "Tom".to_string(),
            age: 18,
            ..Account::default()
        })
        .unwrap();
    engine.flush().unwrap();

    engine
        .track_new(Account {
            name: "Tom".to_string(),
            age: 20,
            ..Account::default()
        })
        .unwrap();
    let err = engine.flush_with_check().unwrap_err();
    match err {
        OrmError::DuplicateKey { index, entry } => {
            assert_eq!(index, "name");
            assert_eq!(entry, "Tom");
        }
        other => panic!("expected duplicate key error, got {other:?}"),
    }
    assert_eq!(harness.db.row_count("Account"), 1);
}

#[test]
fn clear_tracked_entities_drops_pending_work() {
    let harness = prepare(|registry| {
        registry.register_entity(Person::descriptor());
        registry.register_entity(PersonRef::descriptor());
    });
    let mut engine = harness.engine();

    engine
        .track_new(Person {
            name: "gone".to_string(),
            ..Person::default()
        })
        .unwrap();
    assert_eq!(engine.tracked_count(), 1);
    engine.clear_tracked_entities();
    assert_eq!(engine.tracked_count(), 0);

    harness.db.clear_statements();
    engine.flush().unwrap();
    assert!(harness.db.statements().is_empty());
}
