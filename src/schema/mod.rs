//! Registry and schema compiler.
//!
//! A [`Registry`] collects entity descriptors plus string-keyed client
//! configurations, and [`Registry::validate`] compiles everything once into
//! an immutable [`ValidatedRegistry`] that engines are created from. There
//! is no process-wide state: every handle flows through the validated
//! registry instance.

mod alters;
mod table;

pub use alters::Alter;
pub(crate) use alters::get_alters;
pub use table::{
    CachedQueryDef, ColumnKind, ColumnMeta, DEFAULT_CACHED_QUERY_MAX, EnumDef, RefMeta,
    TableSchema,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cache::LocalCache;
use crate::driver::{KvClient, PoolLimits, QueueClient, SqlDriver};
use crate::engine::Engine;
use crate::entity::EntityDescriptor;
use crate::error::{OrmError, Result};

pub(crate) use table::{CompileContext, compile};

/// Default code used whenever a registration or lookup passes `""`.
pub const DEFAULT_CODE: &str = "default";

fn code_or_default(code: &str) -> String {
    if code.is_empty() {
        DEFAULT_CODE.to_string()
    } else {
        code.to_string()
    }
}

#[derive(Clone)]
struct LocalCacheConfig {
    size: usize,
    ttl: Option<Duration>,
}

/// Mutable registration surface. Build one, register everything, then call
/// [`Registry::validate`].
#[derive(Default)]
pub struct Registry {
    entities: Vec<&'static EntityDescriptor>,
    pools: HashMap<String, Arc<dyn SqlDriver>>,
    local_caches: HashMap<String, LocalCacheConfig>,
    kvs: HashMap<String, Arc<dyn KvClient>>,
    lockers: HashMap<String, String>,
    dirty_queues: HashMap<String, String>,
    lazy_queues: HashMap<String, Arc<dyn QueueClient>>,
    log_queues: HashMap<String, Arc<dyn QueueClient>>,
    enums: HashMap<String, EnumDef>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, descriptor: &'static EntityDescriptor) -> &mut Self {
        self.entities.push(descriptor);
        self
    }

    /// Register a MySQL pool under `code` (`""` means default).
    pub fn register_mysql_pool(&mut self, code: &str, driver: Arc<dyn SqlDriver>) -> &mut Self {
        self.pools.insert(code_or_default(code), driver);
        self
    }

    /// Register a shared in-process LRU container.
    pub fn register_local_cache(
        &mut self,
        code: &str,
        size: usize,
        ttl: Option<Duration>,
    ) -> &mut Self {
        self.local_caches
            .insert(code_or_default(code), LocalCacheConfig { size, ttl });
        self
    }

    /// Register a remote KV server (single node or sharded ring behind the
    /// client).
    pub fn register_kv(&mut self, code: &str, client: Arc<dyn KvClient>) -> &mut Self {
        self.kvs.insert(code_or_default(code), client);
        self
    }

    /// Register a distributed-lock server backed by a KV pool.
    pub fn register_locker(&mut self, code: &str, kv_code: &str) -> &mut Self {
        self.lockers
            .insert(code_or_default(code), code_or_default(kv_code));
        self
    }

    /// Register a dirty queue: a KV set named after `code` on the given KV
    /// pool.
    pub fn register_dirty_queue(&mut self, code: &str, kv_code: &str) -> &mut Self {
        self.dirty_queues
            .insert(code_or_default(code), code_or_default(kv_code));
        self
    }

    pub fn register_lazy_queue(&mut self, code: &str, client: Arc<dyn QueueClient>) -> &mut Self {
        self.lazy_queues.insert(code_or_default(code), client);
        self
    }

    pub fn register_log_queue(&mut self, code: &str, client: Arc<dyn QueueClient>) -> &mut Self {
        self.log_queues.insert(code_or_default(code), client);
        self
    }

    /// Register an ordered enum (or set) value list.
    pub fn register_enum(
        &mut self,
        name: &str,
        values: &[&str],
        default: Option<&str>,
    ) -> &mut Self {
        self.enums.insert(
            name.to_string(),
            EnumDef {
                values: values.iter().map(|&value| value.to_string()).collect(),
                default: default.map(str::to_string),
            },
        );
        self
    }

    /// Compile and validate every registration.
    ///
    /// # Errors
    ///
    /// Returns a [`Validation`](OrmError::Validation) or
    /// [`EntityNotRegistered`](OrmError::EntityNotRegistered) error when a
    /// tag cannot be parsed, a referenced code is unknown, or two entities
    /// `cascade`-delete each other.
    pub fn validate(self) -> Result<Arc<ValidatedRegistry>> {
        let entity_names: Vec<String> = self
            .entities
            .iter()
            .map(|descriptor| descriptor.name.to_string())
            .collect();
        let pools: Vec<String> = self.pools.keys().cloned().collect();
        let local_caches: Vec<String> = self.local_caches.keys().cloned().collect();
        let kvs: Vec<String> = self.kvs.keys().cloned().collect();
        let dirty_queues: Vec<String> = self.dirty_queues.keys().cloned().collect();
        let log_queues: Vec<String> = self.log_queues.keys().cloned().collect();
        let enums: Vec<String> = self.enums.keys().cloned().collect();

        let ctx = CompileContext {
            entity_names: &entity_names,
            pools: &pools,
            local_caches: &local_caches,
            kvs: &kvs,
            dirty_queues: &dirty_queues,
            log_queues: &log_queues,
            enums: &enums,
        };

        let mut schemas = HashMap::new();
        let mut descriptors = HashMap::new();
        for &descriptor in &self.entities {
            let schema = compile(descriptor, &ctx)?;
            descriptors.insert(schema.entity_name.clone(), descriptor);
            schemas.insert(schema.entity_name.clone(), Arc::new(schema));
        }

        for locker_kv in self.lockers.values() {
            if !self.kvs.contains_key(locker_kv) {
                return Err(OrmError::Validation(format!(
                    "unknown redis pool '{locker_kv}' for lock server"
                )));
            }
        }
        for queue_kv in self.dirty_queues.values() {
            if !self.kvs.contains_key(queue_kv) {
                return Err(OrmError::Validation(format!(
                    "unknown redis pool '{queue_kv}' for dirty queue"
                )));
            }
        }

        reject_cascade_cycles(&schemas)?;

        let mut usages: HashMap<String, Vec<(String, RefMeta)>> = HashMap::new();
        for schema in schemas.values() {
            for reference in schema.references() {
                usages
                    .entry(reference.entity.clone())
                    .or_default()
                    .push((schema.entity_name.clone(), reference.clone()));
            }
        }

        let local_caches = self
            .local_caches
            .into_iter()
            .map(|(code, config)| {
                let cache = Arc::new(LocalCache::new(&code, config.size, config.ttl));
                (code, cache)
            })
            .collect();

        let registry = ValidatedRegistry {
            schemas,
            descriptors,
            usages,
            pools: self.pools,
            local_caches,
            kvs: self.kvs,
            lockers: self.lockers,
            dirty_queues: self.dirty_queues,
            lazy_queues: self.lazy_queues,
            log_queues: self.log_queues,
            enums: self.enums,
        };
        registry.auto_tune_pools();
        Ok(Arc::new(registry))
    }
}

/// Two tables must not `cascade`-delete each other; chains are fine, cycles
/// (including self-references) are rejected here rather than discovered as
/// unbounded recursion at flush time.
fn reject_cascade_cycles(schemas: &HashMap<String, Arc<TableSchema>>) -> Result<()> {
    // Edge: deleting `referenced` cascades into `referencing`.
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for schema in schemas.values() {
        for reference in schema.references() {
            if reference.cascade {
                edges
                    .entry(reference.entity.as_str())
                    .or_default()
                    .push(schema.entity_name.as_str());
            }
        }
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(node) {
            return Ok(());
        }
        if !visiting.insert(node) {
            return Err(OrmError::Validation(format!(
                "cascade delete cycle detected at entity '{node}'"
            )));
        }
        for &next in edges.get(node).into_iter().flatten() {
            visit(next, edges, visiting, done)?;
        }
        visiting.remove(node);
        done.insert(node);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for node in edges.keys().copied().collect::<Vec<_>>() {
        visit(node, &edges, &mut visiting, &mut done)?;
    }
    Ok(())
}

/// Immutable, validated registry. Safely shared across engines and worker
/// threads.
pub struct ValidatedRegistry {
    schemas: HashMap<String, Arc<TableSchema>>,
    descriptors: HashMap<String, &'static EntityDescriptor>,
    /// referenced entity name → (referencing entity name, ref column).
    usages: HashMap<String, Vec<(String, RefMeta)>>,
    pools: HashMap<String, Arc<dyn SqlDriver>>,
    local_caches: HashMap<String, Arc<LocalCache>>,
    kvs: HashMap<String, Arc<dyn KvClient>>,
    lockers: HashMap<String, String>,
    dirty_queues: HashMap<String, String>,
    lazy_queues: HashMap<String, Arc<dyn QueueClient>>,
    log_queues: HashMap<String, Arc<dyn QueueClient>>,
    enums: HashMap<String, EnumDef>,
}

impl std::fmt::Debug for ValidatedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedRegistry")
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ValidatedRegistry {
    /// Create a per-scope engine handle. Engines are single-threaded and
    /// cheap; workers own one each.
    #[must_use]
    pub fn create_engine(self: &Arc<Self>) -> Engine {
        Engine::new(Arc::clone(self))
    }

    #[must_use]
    pub fn get_table_schema(&self, entity_name: &str) -> Option<&Arc<TableSchema>> {
        self.schemas.get(entity_name)
    }

    pub(crate) fn schema_required(&self, entity_name: &str) -> Result<Arc<TableSchema>> {
        self.schemas.get(entity_name).cloned().ok_or_else(|| {
            OrmError::EntityNotRegistered {
                name: entity_name.to_string(),
            }
        })
    }

    pub(crate) fn descriptor(&self, entity_name: &str) -> Result<&'static EntityDescriptor> {
        self.descriptors.get(entity_name).copied().ok_or_else(|| {
            OrmError::EntityNotRegistered {
                name: entity_name.to_string(),
            }
        })
    }

    /// Schemas holding a reference to `entity_name`, with the ref column.
    #[must_use]
    pub(crate) fn usages_of(&self, entity_name: &str) -> &[(String, RefMeta)] {
        self.usages
            .get(entity_name)
            .map_or(&[], Vec::as_slice)
    }

    pub(crate) fn pool(&self, code: &str) -> Result<&Arc<dyn SqlDriver>> {
        let code = code_or_default(code);
        self.pools.get(&code).ok_or(OrmError::PoolNotRegistered {
            kind: "mysql pool",
            code,
        })
    }

    pub(crate) fn kv(&self, code: &str) -> Result<&Arc<dyn KvClient>> {
        let code = code_or_default(code);
        self.kvs.get(&code).ok_or(OrmError::PoolNotRegistered {
            kind: "redis pool",
            code,
        })
    }

    pub(crate) fn local_cache(&self, code: &str) -> Result<&Arc<LocalCache>> {
        let code = code_or_default(code);
        self.local_caches
            .get(&code)
            .ok_or(OrmError::PoolNotRegistered {
                kind: "local cache pool",
                code,
            })
    }

    pub(crate) fn locker_kv(&self, code: &str) -> Result<&Arc<dyn KvClient>> {
        let code = code_or_default(code);
        let kv_code = self.lockers.get(&code).ok_or(OrmError::PoolNotRegistered {
            kind: "lock server",
            code,
        })?;
        self.kv(kv_code)
    }

    /// The KV client backing a dirty queue code.
    pub(crate) fn dirty_queue_kv(&self, code: &str) -> Result<&Arc<dyn KvClient>> {
        let code = code_or_default(code);
        let kv_code = self
            .dirty_queues
            .get(&code)
            .ok_or(OrmError::PoolNotRegistered {
                kind: "dirty queue",
                code,
            })?;
        self.kv(kv_code)
    }

    pub(crate) fn lazy_queue(&self, code: &str) -> Result<&Arc<dyn QueueClient>> {
        let code = code_or_default(code);
        self.lazy_queues
            .get(&code)
            .ok_or(OrmError::PoolNotRegistered {
                kind: "lazy queue",
                code,
            })
    }

    pub(crate) fn log_queue(&self, code: &str) -> Result<&Arc<dyn QueueClient>> {
        let code = code_or_default(code);
        self.log_queues.get(&code).ok_or(OrmError::PoolNotRegistered {
            kind: "log queue",
            code,
        })
    }

    #[must_use]
    pub fn dirty_queue_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.dirty_queues.keys().cloned().collect();
        codes.sort();
        codes
    }

    #[must_use]
    pub fn lazy_queue_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.lazy_queues.keys().cloned().collect();
        codes.sort();
        codes
    }

    #[must_use]
    pub fn log_queue_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.log_queues.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Entity names with a dirty subscription on the given queue code.
    #[must_use]
    pub fn entities_for_dirty_queue(&self, code: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .schemas
            .values()
            .filter(|schema| schema.has_dirty_subscription(code))
            .map(|schema| schema.entity_name.clone())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    pub(crate) fn enums(&self) -> &HashMap<String, EnumDef> {
        &self.enums
    }

    pub(crate) fn schemas(&self) -> &HashMap<String, Arc<TableSchema>> {
        &self.schemas
    }

    pub(crate) fn table_for_entity(&self) -> HashMap<String, String> {
        self.schemas
            .iter()
            .map(|(name, schema)| (name.clone(), schema.table_name.clone()))
            .collect()
    }

    /// Query each pool's server limits and push derived pool settings:
    /// max-open = ceil(0.9·max_connections), max-idle = max(10,
    /// ceil(0.05·max_connections)) capped to max-open, lifetime =
    /// ceil(0.7·interactive_timeout) seconds.
    fn auto_tune_pools(&self) {
        for (code, pool) in &self.pools {
            let vars = pool.query("SELECT @@max_connections, @@interactive_timeout", &[]);
            match vars {
                Ok(rows) => {
                    let Some(row) = rows.first() else { continue };
                    let max_connections = row
                        .first()
                        .and_then(|value| value.canonical().parse::<u64>().ok());
                    let interactive_timeout = row
                        .get(1)
                        .and_then(|value| value.canonical().parse::<u64>().ok());
                    if let (Some(max_connections), Some(interactive_timeout)) =
                        (max_connections, interactive_timeout)
                    {
                        pool.configure_pool(pool_limits(max_connections, interactive_timeout));
                    }
                }
                Err(err) => {
                    warn!(target: "stratum::db", pool = %code, error = %err,
                        "pool auto-tuning skipped");
                }
            }
        }
    }
}

pub(crate) fn pool_limits(max_connections: u64, interactive_timeout: u64) -> PoolLimits {
    let max_open = max_connections.saturating_mul(9).div_ceil(10);
    let mut max_idle = max_connections.div_ceil(20).max(10);
    if max_idle > max_open {
        max_idle = max_open;
    }
    PoolLimits {
        max_open: u32::try_from(max_open).unwrap_or(u32::MAX),
        max_idle: u32::try_from(max_idle).unwrap_or(u32::MAX),
        conn_max_lifetime_secs: interactive_timeout.saturating_mul(7).div_ceil(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_limits_follow_the_tuning_formula() {
        let limits = pool_limits(100, 28_800);
        assert_eq!(limits.max_open, 90);
        assert_eq!(limits.max_idle, 10);
        assert_eq!(limits.conn_max_lifetime_secs, 20_160);

        let limits = pool_limits(1000, 600);
        assert_eq!(limits.max_open, 900);
        assert_eq!(limits.max_idle, 50);
        assert_eq!(limits.conn_max_lifetime_secs, 420);

        // Tiny servers: idle falls back to max-open.
        let limits = pool_limits(8, 60);
        assert_eq!(limits.max_open, 8);
        assert_eq!(limits.max_idle, 8);
    }
}
