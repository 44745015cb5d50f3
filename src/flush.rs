//! The unit-of-work flush pipeline.
//!
//! A flush classifies the tracked set into inserts, updates and deletes,
//! executes the SQL per table, writes auto-increment IDs back, then applies
//! cache effects and queue publishes in a fixed order: DB → remote KV →
//! local LRU → queues.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::{LocalValue, SENTINEL, SENTINEL_TTL_SECS, build_cache_row, encode_row};
use crate::cached_query::{QueryCacheOp, invalidation_ops};
use crate::dirty::{changed_columns, full_bind};
use crate::engine::Engine;
use crate::entity::{TrackedDyn, same_entity};
use crate::error::{OrmError, Result};
use crate::queue::log::LogRecord;
use crate::queue::lazy::{LAZY_QUEUE, LazyPlan, PlannedSql};
use crate::queue::queue_name;
use crate::schema::TableSchema;
use crate::value::{DATE_TIME_FORMAT, DbValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Insert,
    Update,
    Delete,
    LogicalDelete,
}

impl OpKind {
    const fn dirty_code(self) -> char {
        match self {
            Self::Insert => 'i',
            Self::Update => 'u',
            Self::Delete | Self::LogicalDelete => 'd',
        }
    }

    const fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::LogicalDelete)
    }
}

struct Pending {
    handle: TrackedDyn,
    schema: Arc<TableSchema>,
    op: OpKind,
    /// `db_data` snapshot taken before the flush touched anything.
    old_data: HashMap<String, DbValue>,
    /// Update/logical-delete bind (changed columns only).
    bind: Vec<(String, DbValue)>,
    /// Ref columns bound as NULL to break an insert cycle.
    deferred_columns: Vec<String>,
    id: u64,
}

/// Synchronous flush of the engine's tracked set.
pub(crate) fn flush_sync(engine: &mut Engine) -> Result<()> {
    let tracked = mem::take(&mut engine.tracked);
    if tracked.is_empty() {
        return Ok(());
    }
    let batch = expand_pending_references(engine, tracked)?;
    let mut pendings = classify(engine, &batch, true)?;
    if pendings.is_empty() {
        return Ok(());
    }

    execute_inserts(engine, &mut pendings)?;
    execute_updates(engine, &pendings)?;
    expand_cascade_deletes(engine, &mut pendings)?;
    execute_deletes(engine, &pendings)?;

    post_commit(engine, &pendings)?;
    apply_side_effects(engine, &pendings)
}

/// Serialize the intended SQL and invalidation plan into the lazy queue.
pub(crate) fn flush_lazy(engine: &mut Engine) -> Result<()> {
    // Reject before touching the tracked set so a failed call leaves it
    // unchanged.
    for handle in &engine.tracked {
        let entity = handle.borrow();
        if entity.state().on_duplicate_key_update.is_some() {
            return Err(OrmError::NotSupported(
                "lazy flush on duplicate key not supported".to_string(),
            ));
        }
        if !entity.pending_references().is_empty() {
            return Err(OrmError::NotSupported(
                "lazy flush for unsaved references not supported".to_string(),
            ));
        }
    }

    let tracked = mem::take(&mut engine.tracked);
    if tracked.is_empty() {
        return Ok(());
    }
    let pendings = classify(engine, &tracked, false)?;
    if pendings.is_empty() {
        return Ok(());
    }

    let mut plan = LazyPlan::default();

    // Inserts batched per table; references are all saved here.
    let mut insert_groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (index, pending) in pendings.iter().enumerate() {
        if pending.op != OpKind::Insert {
            continue;
        }
        let table = pending.schema.table_name().to_string();
        match insert_groups.iter_mut().find(|(name, _)| *name == table) {
            Some((_, list)) => list.push(index),
            None => insert_groups.push((table, vec![index])),
        }
    }
    for (_, group) in &insert_groups {
        let schema = &pendings[group[0]].schema;
        let mut rows = Vec::new();
        for &index in group {
            let entity = pendings[index].handle.borrow();
            rows.push(full_bind(schema, &*entity));
        }
        let (sql, params) = insert_sql(schema, &rows, None);
        plan.sql.push(PlannedSql {
            pool: schema.pool_name().to_string(),
            sql,
            params,
            insert_entity: Some(schema.entity_name().to_string()),
        });
    }

    for pending in &pendings {
        match pending.op {
            OpKind::Insert => {}
            OpKind::Update | OpKind::LogicalDelete => {
                let (sql, params) = update_sql(&pending.schema, &pending.bind, &[pending.id]);
                plan.sql.push(PlannedSql {
                    pool: pending.schema.pool_name().to_string(),
                    sql,
                    params,
                    insert_entity: None,
                });
            }
            OpKind::Delete => {
                let (sql, params) = delete_sql(&pending.schema, &[pending.id]);
                plan.sql.push(PlannedSql {
                    pool: pending.schema.pool_name().to_string(),
                    sql,
                    params,
                    insert_entity: None,
                });
            }
        }

        collect_lazy_effects(&mut plan, pending);
    }

    let client = engine.registry.lazy_queue("")?;
    let payload = serde_json::to_vec(&plan)?;
    client.push(&queue_name(LAZY_QUEUE, ""), &payload)?;
    debug!(target: "stratum::queue", statements = plan.sql.len(), "lazy plan queued");
    Ok(())
}

/// Cache-first flush: redis-bound entities with IDs get their new value
/// written to the remote tier and a `name:id` member added to the
/// `dirty_queue` set; the SQL is deferred to the downstream worker.
pub(crate) fn flush_in_cache(engine: &mut Engine) -> Result<()> {
    let tracked = mem::take(&mut engine.tracked);
    if tracked.is_empty() {
        return Ok(());
    }

    let mut fallback = Vec::new();
    let mut kv_sets: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut local_evictions: Vec<(String, String)> = Vec::new();
    let mut members = Vec::new();

    for handle in tracked {
        let schema = engine.init_state(&handle)?;
        let id = handle.borrow().id();
        let redis_bound = schema.redis_cache_code().is_some();
        let marked_delete = handle.borrow().state().is_marked_to_delete();
        if !redis_bound || id == 0 || marked_delete {
            fallback.push(handle);
            continue;
        }
        let changes = changed_columns(&schema, &*handle.borrow());
        if changes.is_empty() {
            continue;
        }
        {
            let mut entity = handle.borrow_mut();
            for change in &changes {
                entity
                    .state_mut()
                    .db_data
                    .insert(change.column.clone(), change.new.clone());
            }
        }
        let entity = handle.borrow();
        let row = build_cache_row(&schema, &*entity);
        let code = schema.redis_cache_code().unwrap_or_default().to_string();
        kv_sets
            .entry(code)
            .or_default()
            .push((schema.cache_key(id), encode_row(&row)));
        // The local tier must stay a subset of the remote one; evict so the
        // next read refills from the fresh remote value.
        if let Some(local_code) = schema.local_cache_code() {
            local_evictions.push((local_code.to_string(), schema.cache_key(id)));
        }
        members.push(format!("{}:{id}", schema.entity_name()));
    }

    if !fallback.is_empty() {
        engine.tracked = fallback;
        flush_sync(engine)?;
    }

    if !members.is_empty() {
        let kv = engine.registry.dirty_queue_kv("dirty_queue")?;
        kv.sadd("dirty_queue", &members)?;
        for (code, pairs) in kv_sets {
            engine.registry.kv(&code)?.mset(&pairs)?;
        }
        for (code, key) in local_evictions {
            engine.registry.local_cache(&code)?.remove(&key);
        }
    }
    Ok(())
}

/// Pull loaded-but-unsaved referenced entities into the batch, parents
/// included before the flush orders them.
fn expand_pending_references(
    engine: &Engine,
    tracked: Vec<TrackedDyn>,
) -> Result<Vec<TrackedDyn>> {
    let mut batch = tracked;
    let mut cursor = 0;
    while cursor < batch.len() {
        let pending = batch[cursor].borrow().pending_references();
        for reference in pending {
            engine.init_state(&reference)?;
            if !batch.iter().any(|known| same_entity(known, &reference)) {
                batch.push(reference);
            }
        }
        cursor += 1;
    }
    Ok(batch)
}

fn classify(engine: &Engine, batch: &[TrackedDyn], run_validate: bool) -> Result<Vec<Pending>> {
    let mut pendings = Vec::new();
    for handle in batch {
        let schema = engine.init_state(handle)?;
        let entity = handle.borrow();
        let id = entity.id();
        let state = entity.state();

        if state.delete {
            if id == 0 {
                continue;
            }
            let logical = schema.has_fake_delete() && !state.force_delete;
            let old_data = state.db_data.clone();
            let op = if logical {
                OpKind::LogicalDelete
            } else {
                OpKind::Delete
            };
            let bind = if logical {
                vec![("FakeDelete".to_string(), DbValue::Bool(true))]
            } else {
                Vec::new()
            };
            drop(entity);
            pendings.push(Pending {
                handle: Rc::clone(handle),
                schema,
                op,
                old_data,
                bind,
                deferred_columns: Vec::new(),
                id,
            });
            continue;
        }

        if id == 0 {
            if run_validate {
                entity.validate()?;
            }
            drop(entity);
            pendings.push(Pending {
                handle: Rc::clone(handle),
                schema,
                op: OpKind::Insert,
                old_data: HashMap::new(),
                bind: Vec::new(),
                deferred_columns: Vec::new(),
                id: 0,
            });
            continue;
        }

        let changes = changed_columns(&schema, &*entity);
        if changes.is_empty() {
            continue;
        }
        if run_validate {
            entity.validate()?;
        }
        let old_data = state.db_data.clone();
        let bind: Vec<(String, DbValue)> = changes
            .iter()
            .map(|change| (change.column.clone(), change.new.clone()))
            .collect();
        drop(entity);
        pendings.push(Pending {
            handle: Rc::clone(handle),
            schema,
            op: OpKind::Update,
            old_data,
            bind,
            deferred_columns: Vec::new(),
            id,
        });
    }
    Ok(pendings)
}

fn insert_sql(
    schema: &TableSchema,
    rows: &[Vec<(String, DbValue)>],
    on_duplicate: Option<&crate::query::Where>,
) -> (String, Vec<DbValue>) {
    let columns: Vec<String> = rows[0].iter().map(|(column, _)| column.clone()).collect();
    let quoted: Vec<String> = columns.iter().map(|column| format!("`{column}`")).collect();
    let placeholders = format!("({})", vec!["?"; columns.len()].join(","));
    let groups = vec![placeholders; rows.len()].join(",");
    let mut sql = format!(
        "INSERT INTO `{}`({}) VALUES {}",
        schema.table_name(),
        quoted.join(","),
        groups
    );
    let mut params: Vec<DbValue> = rows
        .iter()
        .flat_map(|row| row.iter().map(|(_, value)| value.clone()))
        .collect();
    if let Some(clause) = on_duplicate {
        sql.push_str(" ON DUPLICATE KEY UPDATE ");
        sql.push_str(clause.sql());
        params.extend(clause.params().iter().cloned());
    }
    (sql, params)
}

fn update_sql(
    schema: &TableSchema,
    bind: &[(String, DbValue)],
    ids: &[u64],
) -> (String, Vec<DbValue>) {
    let assignments: Vec<String> = bind
        .iter()
        .map(|(column, _)| format!("`{column}` = ?"))
        .collect();
    let mut params: Vec<DbValue> = bind.iter().map(|(_, value)| value.clone()).collect();
    let condition = if ids.len() == 1 {
        params.push(DbValue::Uint(ids[0]));
        "`ID` = ?".to_string()
    } else {
        params.extend(ids.iter().map(|id| DbValue::Uint(*id)));
        format!("`ID` IN ({})", vec!["?"; ids.len()].join(","))
    };
    (
        format!(
            "UPDATE `{}` SET {} WHERE {}",
            schema.table_name(),
            assignments.join(","),
            condition
        ),
        params,
    )
}

fn delete_sql(schema: &TableSchema, ids: &[u64]) -> (String, Vec<DbValue>) {
    let params: Vec<DbValue> = ids.iter().map(|id| DbValue::Uint(*id)).collect();
    (
        format!(
            "DELETE FROM `{}` WHERE `ID` IN ({})",
            schema.table_name(),
            vec!["?"; ids.len()].join(",")
        ),
        params,
    )
}

/// Insert in dependency order. A reference cycle is broken by binding the
/// dependent FK column as NULL and patching it once the parent ID exists.
fn execute_inserts(engine: &Engine, pendings: &mut [Pending]) -> Result<()> {
    let mut remaining: Vec<usize> = pendings
        .iter()
        .enumerate()
        .filter(|(_, pending)| pending.op == OpKind::Insert)
        .map(|(index, _)| index)
        .collect();

    while !remaining.is_empty() {
        let mut ready = Vec::new();
        let mut blocked = Vec::new();
        for &index in &remaining {
            if pendings[index].handle.borrow().pending_references().is_empty() {
                ready.push(index);
            } else {
                blocked.push(index);
            }
        }
        if ready.is_empty() {
            // Cycle: defer the first blocked entity's unsaved FK columns.
            let index = blocked.remove(0);
            let deferred: Vec<String> = {
                let entity = pendings[index].handle.borrow();
                pendings[index]
                    .schema
                    .references()
                    .iter()
                    .filter(|reference| entity.get(&reference.column).is_null())
                    .map(|reference| reference.column.clone())
                    .collect()
            };
            pendings[index].deferred_columns = deferred;
            ready.push(index);
        }

        // Group ready entities per table; on-duplicate-key inserts go one
        // statement each.
        let mut groups: Vec<(String, bool, Vec<usize>)> = Vec::new();
        for &index in &ready {
            let table = pendings[index].schema.table_name().to_string();
            let single = pendings[index]
                .handle
                .borrow()
                .state()
                .on_duplicate_key_update
                .is_some();
            if single {
                groups.push((table, true, vec![index]));
            } else {
                match groups
                    .iter_mut()
                    .find(|(name, odku, _)| *name == table && !*odku)
                {
                    Some((_, _, list)) => list.push(index),
                    None => groups.push((table, false, vec![index])),
                }
            }
        }

        for (_, _, group) in groups {
            let schema = Arc::clone(&pendings[group[0]].schema);
            let mut rows = Vec::new();
            for &index in &group {
                let entity = pendings[index].handle.borrow();
                rows.push(full_bind(&schema, &*entity));
            }
            let clause = pendings[group[0]]
                .handle
                .borrow()
                .state()
                .on_duplicate_key_update
                .clone();
            let (sql, params) = insert_sql(&schema, &rows, clause.as_ref());
            debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "execute");
            let result = engine.registry.pool(schema.pool_name())?.execute(&sql, &params)?;
            for (offset, &index) in group.iter().enumerate() {
                let id = result.last_insert_id + offset as u64;
                pendings[index].id = id;
                pendings[index].handle.borrow_mut().set_id(id);
            }
        }

        remaining = blocked;
    }

    // Patch FK columns deferred to break cycles.
    for index in 0..pendings.len() {
        if pendings[index].deferred_columns.is_empty() {
            continue;
        }
        let schema = Arc::clone(&pendings[index].schema);
        let mut bind = Vec::new();
        for column in &pendings[index].deferred_columns {
            let value = pendings[index].handle.borrow().get(column);
            if !value.is_null() {
                bind.push((column.clone(), value));
            }
        }
        if bind.is_empty() {
            continue;
        }
        let (sql, params) = update_sql(&schema, &bind, &[pendings[index].id]);
        debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "execute");
        engine.registry.pool(schema.pool_name())?.execute(&sql, &params)?;
    }
    Ok(())
}

/// Updates grouped by identical bind signature; logical deletes share the
/// same UPDATE path.
fn execute_updates(engine: &Engine, pendings: &[Pending]) -> Result<()> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (index, pending) in pendings.iter().enumerate() {
        if !matches!(pending.op, OpKind::Update | OpKind::LogicalDelete) {
            continue;
        }
        let signature = format!(
            "{}|{}",
            pending.schema.table_name(),
            pending
                .bind
                .iter()
                .map(|(column, value)| format!("{column}={}", value.canonical()))
                .collect::<Vec<_>>()
                .join(";")
        );
        match groups.iter_mut().find(|(known, _)| *known == signature) {
            Some((_, list)) => list.push(index),
            None => groups.push((signature, vec![index])),
        }
    }
    for (_, group) in groups {
        let schema = &pendings[group[0]].schema;
        let ids: Vec<u64> = group.iter().map(|&index| pendings[index].id).collect();
        let (sql, params) = update_sql(schema, &pendings[group[0]].bind, &ids);
        debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "execute");
        engine.registry.pool(schema.pool_name())?.execute(&sql, &params)?;
    }
    Ok(())
}

/// Proactively mark rows referencing a physically deleted row when the
/// reference policy is `cascade`. `restrict` references are left for the
/// database to reject.
fn expand_cascade_deletes(engine: &mut Engine, pendings: &mut Vec<Pending>) -> Result<()> {
    let mut cursor = 0;
    while cursor < pendings.len() {
        if pendings[cursor].op != OpKind::Delete {
            cursor += 1;
            continue;
        }
        let schema = Arc::clone(&pendings[cursor].schema);
        let id = pendings[cursor].id;
        cursor += 1;

        let usages: Vec<_> = engine
            .registry
            .usages_of(schema.entity_name())
            .iter()
            .filter(|(_, reference)| reference.cascade)
            .cloned()
            .collect();
        for (referencing_entity, reference) in usages {
            let child_schema = engine.registry.schema_required(&referencing_entity)?;
            // No fake-delete filter: rows must go away physically for the
            // parent delete to pass its FK checks.
            let sql = format!(
                "SELECT `ID` FROM `{}` WHERE `{}` IN (?)",
                child_schema.table_name(),
                reference.column
            );
            let rows = engine
                .registry
                .pool(child_schema.pool_name())?
                .query(&sql, &[DbValue::Uint(id)])?;
            for row in rows {
                let child_id = match row.first() {
                    Some(DbValue::Uint(child_id)) => *child_id,
                    _ => continue,
                };
                let already = pendings.iter().any(|pending| {
                    pending.op.is_delete()
                        && pending.id == child_id
                        && pending.schema.entity_name() == child_schema.entity_name()
                });
                if already {
                    continue;
                }
                let mut loaded =
                    crate::loader::load_by_ids_dyn(engine, &child_schema, &[child_id], true)?;
                let Some(handle) = loaded.remove(&child_id) else {
                    continue;
                };
                {
                    let mut entity = handle.dynamic.borrow_mut();
                    entity.state_mut().delete = true;
                    entity.state_mut().force_delete = true;
                }
                let old_data = handle.dynamic.borrow().state().db_data.clone();
                pendings.push(Pending {
                    handle: handle.dynamic,
                    schema: Arc::clone(&child_schema),
                    op: OpKind::Delete,
                    old_data,
                    bind: Vec::new(),
                    deferred_columns: Vec::new(),
                    id: child_id,
                });
            }
        }
    }
    Ok(())
}

/// Physical deletes, children before parents.
fn execute_deletes(engine: &Engine, pendings: &[Pending]) -> Result<()> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (index, pending) in pendings.iter().enumerate().rev() {
        if pending.op != OpKind::Delete {
            continue;
        }
        let table = pending.schema.table_name().to_string();
        match groups.iter_mut().find(|(known, _)| *known == table) {
            Some((_, list)) => list.push(index),
            None => groups.push((table, vec![index])),
        }
    }
    for (_, group) in groups {
        let schema = &pendings[group[0]].schema;
        let ids: Vec<u64> = group.iter().map(|&index| pendings[index].id).collect();
        let (sql, params) = delete_sql(schema, &ids);
        debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "execute");
        engine.registry.pool(schema.pool_name())?.execute(&sql, &params)?;
    }
    Ok(())
}

/// Update every entity's ORM state to the post-commit truth and run
/// `after_saved` hooks.
fn post_commit(engine: &mut Engine, pendings: &[Pending]) -> Result<()> {
    for pending in pendings {
        {
            let mut entity = pending.handle.borrow_mut();
            match pending.op {
                OpKind::Insert => {
                    let bind = full_bind(&pending.schema, &*entity);
                    let state = entity.state_mut();
                    state.db_data.clear();
                    state.db_data.insert("ID".to_string(), DbValue::Uint(pending.id));
                    for (column, value) in bind {
                        state.db_data.insert(column, value);
                    }
                    state.loaded = true;
                }
                OpKind::Update | OpKind::LogicalDelete => {
                    let bind = pending.bind.clone();
                    let state = entity.state_mut();
                    for (column, value) in bind {
                        state.db_data.insert(column, value);
                    }
                }
                OpKind::Delete => {
                    let state = entity.state_mut();
                    state.db_data.clear();
                    state.loaded = false;
                }
            }
            let state = entity.state_mut();
            state.delete = false;
            state.force_delete = false;
            state.on_duplicate_key_update = None;
        }
        if matches!(pending.op, OpKind::Insert | OpKind::Update) {
            pending.handle.borrow_mut().after_saved(engine);
        }
    }
    Ok(())
}

struct SideEffects {
    local_sets: Vec<(String, String, LocalValue)>,
    local_removes: Vec<(String, String)>,
    kv_sets: HashMap<String, Vec<(String, String)>>,
    kv_ttl_sets: Vec<(String, String, String, u64)>,
    kv_dels: HashMap<String, Vec<String>>,
    /// Cached-query list rebuilds: DEL then RPUSH, head element is the total.
    kv_list_sets: Vec<(String, String, Vec<String>)>,
    dirty: HashMap<String, Vec<String>>,
    logs: Vec<(String, LogRecord)>,
}

/// Cache effects and queue publishes, in tier order.
fn apply_side_effects(engine: &Engine, pendings: &[Pending]) -> Result<()> {
    let mut effects = SideEffects {
        local_sets: Vec::new(),
        local_removes: Vec::new(),
        kv_sets: HashMap::new(),
        kv_ttl_sets: Vec::new(),
        kv_dels: HashMap::new(),
        kv_list_sets: Vec::new(),
        dirty: HashMap::new(),
        logs: Vec::new(),
    };

    for pending in pendings {
        collect_entity_cache_effects(&mut effects, pending);
        collect_query_cache_effects(&mut effects, pending);
        collect_queue_effects(&mut effects, pending);
    }

    // Remote KV first, then the local LRU, then queue publishes. On a
    // failure mid-sequence evict both tiers so the next read falls through
    // to the database.
    let kv_result: Result<()> = (|| {
        for (code, pairs) in &effects.kv_sets {
            engine.registry.kv(code)?.mset(pairs)?;
        }
        for (code, key, value, ttl) in &effects.kv_ttl_sets {
            engine.registry.kv(code)?.set(key, value, Some(*ttl))?;
        }
        for (code, keys) in &effects.kv_dels {
            engine.registry.kv(code)?.del(keys)?;
        }
        for (code, key, values) in &effects.kv_list_sets {
            let kv = engine.registry.kv(code)?;
            kv.del(std::slice::from_ref(key))?;
            kv.rpush(key, values)?;
        }
        Ok(())
    })();
    if let Err(err) = kv_result {
        evict_after_failure(engine, &effects);
        return Err(err);
    }

    for (code, key, value) in effects.local_sets {
        engine.registry.local_cache(&code)?.set(&key, value);
    }
    for (code, key) in effects.local_removes {
        engine.registry.local_cache(&code)?.remove(&key);
    }

    for (queue_code, members) in &effects.dirty {
        let kv = engine.registry.dirty_queue_kv(queue_code)?;
        kv.sadd(queue_code, members)?;
        debug!(target: "stratum::queue", queue = %queue_code, count = members.len(),
            "dirty members published");
    }
    for (queue_code, record) in &effects.logs {
        let client = engine.registry.log_queue(queue_code)?;
        let payload = serde_json::to_vec(record)?;
        client.push(&queue_name(crate::queue::log::LOG_QUEUE, queue_code), &payload)?;
    }
    Ok(())
}

fn evict_after_failure(engine: &Engine, effects: &SideEffects) {
    for (code, pairs) in &effects.kv_sets {
        if let Ok(kv) = engine.registry.kv(code) {
            let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();
            let _ = kv.del(&keys);
        }
    }
    for (code, key, _, _) in &effects.kv_ttl_sets {
        if let Ok(kv) = engine.registry.kv(code) {
            let _ = kv.del(std::slice::from_ref(key));
        }
    }
    for (code, key, _) in &effects.local_sets {
        if let Ok(cache) = engine.registry.local_cache(code) {
            cache.remove(key);
        }
    }
}

fn collect_entity_cache_effects(effects: &mut SideEffects, pending: &Pending) {
    let schema = &pending.schema;
    let key = schema.cache_key(pending.id);
    let entity = pending.handle.borrow();
    match pending.op {
        OpKind::Insert | OpKind::Update | OpKind::LogicalDelete => {
            let row = build_cache_row(schema, &*entity);
            if let Some(code) = schema.local_cache_code() {
                effects.local_sets.push((
                    code.to_string(),
                    key.clone(),
                    LocalValue::Row(Arc::new(row.clone())),
                ));
            }
            if let Some(code) = schema.redis_cache_code() {
                effects
                    .kv_sets
                    .entry(code.to_string())
                    .or_default()
                    .push((key, encode_row(&row)));
            }
        }
        OpKind::Delete => {
            if let Some(code) = schema.local_cache_code() {
                effects
                    .local_sets
                    .push((code.to_string(), key.clone(), LocalValue::Sentinel));
            }
            if let Some(code) = schema.redis_cache_code() {
                effects.kv_ttl_sets.push((
                    code.to_string(),
                    key,
                    SENTINEL.to_string(),
                    SENTINEL_TTL_SECS,
                ));
            }
        }
    }
}

fn collect_query_cache_effects(effects: &mut SideEffects, pending: &Pending) {
    if pending.schema.cached_queries().is_empty() {
        return;
    }
    let entity = pending.handle.borrow();
    let new_data = &entity.state().db_data;
    let changed: HashSet<String> = pending
        .bind
        .iter()
        .map(|(column, _)| column.clone())
        .collect();
    let ops = invalidation_ops(
        &pending.schema,
        pending.op,
        &pending.old_data,
        new_data,
        &changed,
        pending.id,
    );
    for op in ops {
        match op {
            QueryCacheOp::Del(key) => {
                if let Some(code) = pending.schema.local_cache_code() {
                    effects.local_removes.push((code.to_string(), key.clone()));
                }
                if let Some(code) = pending.schema.redis_cache_code() {
                    effects
                        .kv_dels
                        .entry(code.to_string())
                        .or_default()
                        .push(key);
                }
            }
            QueryCacheOp::SetOne { key, id } => {
                if let Some(code) = pending.schema.local_cache_code() {
                    effects.local_sets.push((
                        code.to_string(),
                        key.clone(),
                        LocalValue::IdList(Arc::new(crate::cache::CachedIds {
                            total: 1,
                            ids: vec![id],
                        })),
                    ));
                }
                if let Some(code) = pending.schema.redis_cache_code() {
                    effects.kv_list_sets.push((
                        code.to_string(),
                        key,
                        vec!["1".to_string(), id.to_string()],
                    ));
                }
            }
        }
    }
}

fn collect_queue_effects(effects: &mut SideEffects, pending: &Pending) {
    let schema = &pending.schema;
    let changed: Vec<String> = pending
        .bind
        .iter()
        .map(|(column, _)| column.clone())
        .collect();
    let codes = match pending.op {
        OpKind::Update => schema.dirty_queues_for(Some(&changed)),
        _ => schema.dirty_queues_for(None),
    };
    for code in codes {
        effects.dirty.entry(code).or_default().push(format!(
            "{}:{}:{}",
            schema.entity_name(),
            pending.op.dirty_code(),
            pending.id
        ));
    }

    if let Some(log_code) = schema.log_queue_code() {
        effects
            .logs
            .push((log_code.to_string(), build_log_record(pending)));
    }
}

fn build_log_record(pending: &Pending) -> LogRecord {
    let entity = pending.handle.borrow();
    let meta = entity
        .state()
        .log_meta
        .clone()
        .map(serde_json::Value::Object);
    let (before, changes) = match pending.op {
        OpKind::Insert => (
            None,
            Some(values_json(full_bind(&pending.schema, &*entity))),
        ),
        OpKind::Update | OpKind::LogicalDelete => {
            let before: Vec<(String, DbValue)> = pending
                .bind
                .iter()
                .map(|(column, _)| {
                    (
                        column.clone(),
                        pending
                            .old_data
                            .get(column)
                            .cloned()
                            .unwrap_or(DbValue::Null),
                    )
                })
                .collect();
            (
                Some(values_json(before)),
                Some(values_json(pending.bind.clone())),
            )
        }
        OpKind::Delete => {
            let before: Vec<(String, DbValue)> = pending
                .old_data
                .iter()
                .filter(|(column, _)| column.as_str() != "ID")
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            (Some(values_json(before)), None)
        }
    };
    LogRecord {
        pool_name: pending.schema.pool_name().to_string(),
        table_name: pending.schema.log_table().to_string(),
        id: pending.id,
        updated: Utc::now().format(DATE_TIME_FORMAT).to_string(),
        meta,
        before,
        changes,
    }
}

fn values_json(values: Vec<(String, DbValue)>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (column, value) in values {
        let rendered = if value.is_null() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(value.canonical())
        };
        map.insert(column, rendered);
    }
    serde_json::Value::Object(map)
}

fn collect_lazy_effects(plan: &mut LazyPlan, pending: &Pending) {
    let schema = &pending.schema;
    if pending.op != OpKind::Insert {
        let key = schema.cache_key(pending.id);
        if let Some(code) = schema.local_cache_code() {
            plan.local_invalidate.push((code.to_string(), key.clone()));
        }
        if let Some(code) = schema.redis_cache_code() {
            plan.kv_invalidate.push((code.to_string(), key));
        }
    }

    if !schema.cached_queries().is_empty() {
        let entity = pending.handle.borrow();
        let new_data: HashMap<String, DbValue> = schema
            .column_names()
            .iter()
            .skip(1)
            .map(|column| (column.clone(), entity.get(column)))
            .collect();
        let changed: HashSet<String> = pending
            .bind
            .iter()
            .map(|(column, _)| column.clone())
            .collect();
        for op in invalidation_ops(
            schema,
            pending.op,
            &pending.old_data,
            &new_data,
            &changed,
            pending.id,
        ) {
            let key = match op {
                QueryCacheOp::Del(key) | QueryCacheOp::SetOne { key, .. } => key,
            };
            if let Some(code) = schema.local_cache_code() {
                plan.local_invalidate.push((code.to_string(), key.clone()));
            }
            if let Some(code) = schema.redis_cache_code() {
                plan.kv_invalidate.push((code.to_string(), key));
            }
        }
    }

    // Inserts have no ID until the plan replays, so their dirty and log
    // events cannot be written here.
    if pending.op == OpKind::Insert {
        return;
    }
    let changed: Vec<String> = pending
        .bind
        .iter()
        .map(|(column, _)| column.clone())
        .collect();
    let codes = match pending.op {
        OpKind::Update => schema.dirty_queues_for(Some(&changed)),
        _ => schema.dirty_queues_for(None),
    };
    for code in codes {
        plan.dirty.push((
            code,
            format!(
                "{}:{}:{}",
                schema.entity_name(),
                pending.op.dirty_code(),
                pending.id
            ),
        ));
    }
    if let Some(log_code) = schema.log_queue_code() {
        plan.log
            .push((log_code.to_string(), build_log_record(pending)));
    }
}
