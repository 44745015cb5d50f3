mod common;

use common::entities::Audited;
use common::prepare;
use std::cell::RefCell;
use std::rc::Rc;
use stratum::driver::QueueClient;
use stratum::{Entity, LogReceiver, LogRecord};

#[test]
fn flushes_emit_audit_records_and_the_receiver_stores_them() {
    let harness = prepare(|registry| {
        registry.register_entity(Audited::descriptor());
    });
    let mut engine = harness.engine();

    let audited = engine
        .track_new(Audited {
            name: "doc".to_string(),
            ..Audited::default()
        })
        .unwrap();
    engine
        .set_log_meta(&audited, "user", serde_json::json!("admin"))
        .unwrap();
    engine.flush().unwrap();
    assert_eq!(harness.queue.len("orm_log").unwrap(), 1);

    let seen: Rc<RefCell<Vec<LogRecord>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let mut receiver = LogReceiver::new(harness.engine());
    receiver.disable_loop();
    receiver.set_logger(move |record| sink.borrow_mut().push(record.clone()));
    receiver.digest().unwrap();

    {
        let records = seen.borrow();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.pool_name, "default");
        assert_eq!(record.table_name, "_log_default_Audited");
        assert_eq!(record.id, 1);
        // `YYYY-MM-DD HH:MM:SS`.
        assert_eq!(record.updated.len(), 19);
        assert_eq!(record.meta, Some(serde_json::json!({"user": "admin"})));
        assert!(record.before.is_none());
        assert_eq!(record.changes, Some(serde_json::json!({"Name": "doc"})));
    }

    let row = harness.db.row("_log_default_Audited", 1).unwrap();
    assert_eq!(row["entity_id"].canonical(), "1");
    assert_eq!(row["added_at"].canonical().len(), 19);
    assert!(row["meta"].canonical().contains("admin"));

    // Updates carry before/changes for the touched columns only.
    engine.track(&audited).unwrap();
    audited.borrow_mut().name = "doc v2".to_string();
    engine.flush().unwrap();
    receiver.digest().unwrap();

    {
        let records = seen.borrow();
        let record = records.last().unwrap();
        assert_eq!(record.before, Some(serde_json::json!({"Name": "doc"})));
        assert_eq!(record.changes, Some(serde_json::json!({"Name": "doc v2"})));
    }

    // Deletes log the final row state and no changes.
    engine.mark_to_delete(&audited).unwrap();
    engine.flush().unwrap();
    receiver.digest().unwrap();

    {
        let records = seen.borrow();
        let record = records.last().unwrap();
        assert_eq!(record.before, Some(serde_json::json!({"Name": "doc v2"})));
        assert!(record.changes.is_none());
    }
    assert_eq!(harness.db.row_count("_log_default_Audited"), 3);
}
