//! Shared test harness: an in-memory stack wired into a validated registry.

#![allow(dead_code)]

pub mod entities;

use std::sync::Arc;

use stratum::driver::{KvClient, QueueClient, SqlDriver};
use stratum::testing::{MemoryDb, MemoryKv, MemoryQueue, create_schema_tables};
use stratum::{Engine, Registry, ValidatedRegistry};

pub struct Harness {
    pub registry: Arc<ValidatedRegistry>,
    pub db: Arc<MemoryDb>,
    pub kv: Arc<MemoryKv>,
    pub queue: Arc<MemoryQueue>,
}

impl Harness {
    pub fn engine(&self) -> Engine {
        self.registry.create_engine()
    }
}

/// Build a registry over fresh in-memory drivers, register the caller's
/// entities, validate, and create the schema tables.
pub fn prepare(configure: impl FnOnce(&mut Registry)) -> Harness {
    stratum::logging::init_test_logging();

    let db = Arc::new(MemoryDb::new());
    let kv = Arc::new(MemoryKv::new());
    let queue = Arc::new(MemoryQueue::new());

    let mut registry = Registry::new();
    registry.register_mysql_pool("", Arc::clone(&db) as Arc<dyn SqlDriver>);
    registry.register_kv("", Arc::clone(&kv) as Arc<dyn KvClient>);
    registry.register_local_cache("", 1000, None);
    registry.register_lazy_queue("", Arc::clone(&queue) as Arc<dyn QueueClient>);
    registry.register_log_queue("", Arc::clone(&queue) as Arc<dyn QueueClient>);
    registry.register_dirty_queue("test", "");
    registry.register_dirty_queue("dirty_queue", "");
    registry.register_locker("", "");
    configure(&mut registry);

    let registry = registry.validate().expect("registry validates");
    create_schema_tables(&registry, "default", &db);

    Harness {
        registry,
        db,
        kv,
        queue,
    }
}
