mod common;

use common::entities::Note;
use common::prepare;
use stratum::{DbValue, Entity, Where};

fn note_harness() -> common::Harness {
    prepare(|registry| {
        registry.register_entity(Note::descriptor());
    })
}

#[test]
fn mark_to_delete_flips_the_flag_instead_of_deleting() {
    let harness = note_harness();
    let mut engine = harness.engine();

    let one = engine
        .track_new(Note {
            name: "one".to_string(),
            ..Note::default()
        })
        .unwrap();
    let two = engine
        .track_new(Note {
            name: "two".to_string(),
            ..Note::default()
        })
        .unwrap();
    engine.flush().unwrap();

    let (total, _) = engine
        .cached_search::<Note>("IndexAll", None, vec![], &[])
        .unwrap();
    assert_eq!(total, 2);
    let (total, _) = engine
        .cached_search::<Note>(
            "IndexName",
            None,
            vec![DbValue::Text("two".to_string())],
            &[],
        )
        .unwrap();
    assert_eq!(total, 1);

    engine.mark_to_delete(&two).unwrap();
    assert!(two.borrow().fake_delete);
    assert!(engine.is_dirty(&*two.borrow()).unwrap());
    engine.flush().unwrap();
    assert!(!engine.is_dirty(&*two.borrow()).unwrap());

    // The row is physically present with the flag set.
    assert_eq!(harness.db.row_count("Note"), 2);
    assert_eq!(
        harness.db.row("Note", 2).unwrap()["FakeDelete"].canonical(),
        "1"
    );

    // Searches transparently exclude logically deleted rows.
    let (total, rows) = engine
        .search_with_count::<Note>(&Where::all(), None, &[])
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].borrow().name, "one");

    // The by-ID path still returns the row, flag raised.
    let loaded = engine.load_by_id::<Note>(2, &[]).unwrap().unwrap();
    assert!(loaded.borrow().fake_delete);
    let loaded = engine.load_by_id::<Note>(1, &[]).unwrap().unwrap();
    assert!(!loaded.borrow().fake_delete);

    // Cached queries treat the flip as a delete.
    let (total, _) = engine
        .cached_search::<Note>("IndexAll", None, vec![], &[])
        .unwrap();
    assert_eq!(total, 1);
    let (total, _) = engine
        .cached_search::<Note>(
            "IndexName",
            None,
            vec![DbValue::Text("two".to_string())],
            &[],
        )
        .unwrap();
    assert_eq!(total, 0);
    drop(one);
}

#[test]
fn force_mark_to_delete_removes_the_row_physically() {
    let harness = note_harness();
    let mut engine = harness.engine();

    let one = engine
        .track_new(Note {
            name: "one".to_string(),
            ..Note::default()
        })
        .unwrap();
    let two = engine
        .track_new(Note {
            name: "two".to_string(),
            ..Note::default()
        })
        .unwrap();
    engine.flush().unwrap();

    engine.force_mark_to_delete(&two).unwrap();
    engine.flush().unwrap();

    assert_eq!(harness.db.row_count("Note"), 1);
    let loaded = engine.load_by_id::<Note>(2, &[]).unwrap();
    assert!(loaded.is_none());

    // Fake-deleting the last row empties every search surface.
    engine.mark_to_delete(&one).unwrap();
    engine.flush().unwrap();
    let found = engine.search_one::<Note>(&Where::all()).unwrap();
    assert!(found.is_none());
}
