mod common;

use common::entities::PersonRef;
use common::prepare;
use std::time::Duration;
use stratum::Entity;

#[test]
fn locks_are_exclusive_until_released() {
    let harness = prepare(|registry| {
        registry.register_entity(PersonRef::descriptor());
    });
    let engine = harness.engine();

    let locker = engine.locker("").unwrap();
    let lock = locker
        .obtain("lazy_consumer", Duration::from_secs(30))
        .unwrap()
        .expect("first holder wins");

    // A second engine contends for the same key and loses.
    let other = harness.engine().locker("").unwrap();
    assert!(other
        .obtain("lazy_consumer", Duration::from_secs(30))
        .unwrap()
        .is_none());

    lock.release().unwrap();
    assert!(other
        .obtain("lazy_consumer", Duration::from_secs(30))
        .unwrap()
        .is_some());
}

#[test]
fn dropping_a_lock_releases_it() {
    let harness = prepare(|registry| {
        registry.register_entity(PersonRef::descriptor());
    });
    let engine = harness.engine();
    let locker = engine.locker("").unwrap();

    {
        let _guard = locker
            .obtain("scoped", Duration::from_secs(30))
            .unwrap()
            .expect("acquired");
        assert!(locker
            .obtain("scoped", Duration::from_secs(30))
            .unwrap()
            .is_none());
    }
    assert!(locker
        .obtain("scoped", Duration::from_secs(30))
        .unwrap()
        .is_some());
}

#[test]
fn client_accessors_resolve_default_codes() {
    let harness = prepare(|registry| {
        registry.register_entity(PersonRef::descriptor());
    });
    let engine = harness.engine();

    assert!(engine.db("").is_ok());
    assert!(engine.kv("").is_ok());
    assert!(engine.local_cache("").is_ok());
    assert!(engine.db("missing").is_err());
    assert!(engine.locker("missing").is_err());
}
