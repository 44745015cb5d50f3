//! Read paths: multi-tier by-ID loads, raw searches and reference warm-up.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{LocalValue, SENTINEL, SENTINEL_TTL_SECS, decode_row, encode_row};
use crate::engine::Engine;
use crate::entity::{HydrationSource, TrackedDyn};
use crate::error::{OrmError, Result};
use crate::query::{Pager, Where};
use crate::schema::TableSchema;
use crate::value::DbValue;

/// A loaded entity in both its engine-facing and downcastable views.
#[derive(Clone)]
pub(crate) struct LoadedHandle {
    pub dynamic: TrackedDyn,
    pub any: Rc<dyn Any>,
}

/// Multi-tier batched load by primary key. Consults the local LRU, then the
/// remote KV, then the database; each miss tier is filled on the way back.
/// Missing IDs get the negative sentinel (remote TTL ≈ 60 s). The by-ID
/// path never appends the fake-delete filter.
pub(crate) fn load_by_ids_dyn(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    ids: &[u64],
    use_cache: bool,
) -> Result<HashMap<u64, LoadedHandle>> {
    let mut unique: Vec<u64> = Vec::new();
    let mut seen = HashSet::new();
    for &id in ids {
        if id != 0 && seen.insert(id) {
            unique.push(id);
        }
    }
    let mut found: HashMap<u64, LoadedHandle> = HashMap::new();
    if unique.is_empty() {
        return Ok(found);
    }
    let mut remaining = unique;

    let local = match schema.local_cache_code() {
        Some(code) if use_cache => Some(engine.registry.local_cache(code)?),
        _ => None,
    };
    let redis = match schema.redis_cache_code() {
        Some(code) if use_cache => Some(engine.registry.kv(code)?),
        _ => None,
    };

    if let Some(cache) = local {
        let mut missed = Vec::new();
        for id in remaining {
            match cache.get(&schema.cache_key(id)) {
                Some(LocalValue::Sentinel) => {}
                Some(LocalValue::Row(row)) => {
                    found.insert(id, build_from_cache_row(engine, schema, id, &row)?);
                }
                _ => missed.push(id),
            }
        }
        remaining = missed;
    }

    if let Some(kv) = redis {
        if !remaining.is_empty() {
            let keys: Vec<String> = remaining.iter().map(|id| schema.cache_key(*id)).collect();
            let values = kv.mget(&keys)?;
            let mut missed = Vec::new();
            let expected = schema.column_names().len() - 1;
            for (id, value) in remaining.into_iter().zip(values) {
                match value {
                    Some(raw) if raw == SENTINEL => {
                        if let Some(cache) = local {
                            cache.set(&schema.cache_key(id), LocalValue::Sentinel);
                        }
                    }
                    Some(raw) => match decode_row(&raw, expected) {
                        Some(row) => {
                            if let Some(cache) = local {
                                cache.set(
                                    &schema.cache_key(id),
                                    LocalValue::Row(Arc::new(row.clone())),
                                );
                            }
                            found.insert(id, build_from_cache_row(engine, schema, id, &row)?);
                        }
                        // Unparsable value: fall through to the database.
                        None => missed.push(id),
                    },
                    None => missed.push(id),
                }
            }
            remaining = missed;
        }
    }

    if !remaining.is_empty() {
        let loaded = select_by_ids(engine, schema, &remaining)?;
        let mut kv_fill: Vec<(String, String)> = Vec::new();
        for id in remaining {
            match loaded.get(&id) {
                Some(handle) => {
                    if use_cache {
                        let row = crate::cache::build_cache_row(schema, &*handle.dynamic.borrow());
                        if let Some(cache) = local {
                            cache.set(&schema.cache_key(id), LocalValue::Row(Arc::new(row.clone())));
                        }
                        if redis.is_some() {
                            kv_fill.push((schema.cache_key(id), encode_row(&row)));
                        }
                    }
                    found.insert(id, handle.clone());
                }
                None => {
                    if let Some(cache) = local {
                        cache.set(&schema.cache_key(id), LocalValue::Sentinel);
                    }
                    if let Some(kv) = redis {
                        kv.set(&schema.cache_key(id), SENTINEL, Some(SENTINEL_TTL_SECS))?;
                    }
                }
            }
        }
        if let Some(kv) = redis {
            if !kv_fill.is_empty() {
                kv.mset(&kv_fill)?;
            }
        }
    }

    Ok(found)
}

fn select_by_ids(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    ids: &[u64],
) -> Result<HashMap<u64, LoadedHandle>> {
    let columns: Vec<String> = schema
        .column_names()
        .iter()
        .map(|column| format!("`{column}`"))
        .collect();
    let sql = format!(
        "SELECT {} FROM `{}` WHERE `ID` IN ({})",
        columns.join(","),
        schema.table_name(),
        vec!["?"; ids.len()].join(",")
    );
    let params: Vec<DbValue> = ids.iter().map(|id| DbValue::Uint(*id)).collect();
    debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "query");
    let rows = engine.registry.pool(schema.pool_name())?.query(&sql, &params)?;
    let mut found = HashMap::new();
    for row in rows {
        let handle = build_from_db_row(engine, schema, &row)?;
        let id = handle.dynamic.borrow().id();
        found.insert(id, handle);
    }
    Ok(found)
}

/// Materialize an entity from a database row (`ID` first, then the schema's
/// column order).
fn build_from_db_row(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    row: &[DbValue],
) -> Result<LoadedHandle> {
    let Some(DbValue::Uint(id)) = row.first().cloned().map(normalize_id) else {
        return Err(OrmError::Driver(crate::driver::DriverError::Other(
            "row is missing its ID column".to_string(),
        )));
    };
    let created = (engine.registry.descriptor(schema.entity_name())?.create)();
    {
        let mut entity = created.dynamic.borrow_mut();
        entity.set_id(id);
        entity.state_mut().initialized = true;
        for (index, column) in schema.column_names().iter().enumerate().skip(1) {
            let value = row.get(index).cloned().unwrap_or(DbValue::Null);
            entity.set(column, value.clone())?;
            entity.state_mut().db_data.insert(column.clone(), value);
        }
        let state = entity.state_mut();
        state.db_data.insert("ID".to_string(), DbValue::Uint(id));
        state.loaded = true;
    }
    Ok(LoadedHandle {
        dynamic: created.dynamic,
        any: created.any,
    })
}

fn normalize_id(value: DbValue) -> DbValue {
    match value {
        DbValue::Int(id) if id >= 0 => DbValue::Uint(id.unsigned_abs()),
        other => other,
    }
}

fn build_from_cache_row(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    id: u64,
    row: &[String],
) -> Result<LoadedHandle> {
    let created = (engine.registry.descriptor(schema.entity_name())?.create)();
    {
        let mut entity = created.dynamic.borrow_mut();
        entity.set_id(id);
        entity.state_mut().initialized = true;
        for (meta, raw) in schema.columns().iter().zip(row) {
            let value = DbValue::from_cache_str(&meta.kind, raw);
            // A cache value is canonical by construction; a set failure
            // would mean the schema and value shape disagree, which
            // decode_row already guards against.
            let _ = entity.set(&meta.name, value.clone());
            entity.state_mut().db_data.insert(meta.name.clone(), value);
        }
        let state = entity.state_mut();
        state.db_data.insert("ID".to_string(), DbValue::Uint(id));
        state.loaded = true;
    }
    Ok(LoadedHandle {
        dynamic: created.dynamic,
        any: created.any,
    })
}

/// ID-only search. `with_count` follows the found-rows shortcut: a full
/// page triggers one `count(1)` query, a short page derives the total from
/// the offset.
pub(crate) fn search_ids(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    predicate: &Where,
    pager: Option<&Pager>,
    with_count: bool,
) -> Result<(Vec<u64>, usize)> {
    let predicate = apply_fake_delete(schema, predicate);
    let mut sql = format!(
        "SELECT `ID` FROM `{}` WHERE {}",
        schema.table_name(),
        predicate.sql()
    );
    if let Some(pager) = pager {
        sql.push_str(&pager.limit_sql());
    }
    debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "query");
    let rows = engine
        .registry
        .pool(schema.pool_name())?
        .query(&sql, predicate.params())?;
    let ids: Vec<u64> = rows
        .into_iter()
        .filter_map(|row| match row.first().cloned().map(normalize_id) {
            Some(DbValue::Uint(id)) => Some(id),
            _ => None,
        })
        .collect();
    let total = total_rows(engine, schema, &predicate, pager, with_count, ids.len())?;
    Ok((ids, total))
}

/// Entity search straight against the database; cache tiers are neither
/// consulted nor filled.
pub(crate) fn search_handles(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    predicate: &Where,
    pager: Option<&Pager>,
    with_count: bool,
) -> Result<(Vec<LoadedHandle>, usize)> {
    let predicate = apply_fake_delete(schema, predicate);
    let columns: Vec<String> = schema
        .column_names()
        .iter()
        .map(|column| format!("`{column}`"))
        .collect();
    let mut sql = format!(
        "SELECT {} FROM `{}` WHERE {}",
        columns.join(","),
        schema.table_name(),
        predicate.sql()
    );
    if let Some(pager) = pager {
        sql.push_str(&pager.limit_sql());
    }
    debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "query");
    let rows = engine
        .registry
        .pool(schema.pool_name())?
        .query(&sql, predicate.params())?;
    let mut handles = Vec::with_capacity(rows.len());
    for row in rows {
        handles.push(build_from_db_row(engine, schema, &row)?);
    }
    let total = total_rows(engine, schema, &predicate, pager, with_count, handles.len())?;
    Ok((handles, total))
}

fn apply_fake_delete(schema: &TableSchema, predicate: &Where) -> Where {
    if schema.has_fake_delete() && !predicate.mentions_fake_delete() {
        predicate.with_fake_delete_filter()
    } else {
        predicate.clone()
    }
}

fn total_rows(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    predicate: &Where,
    pager: Option<&Pager>,
    with_count: bool,
    found: usize,
) -> Result<usize> {
    if !with_count {
        return Ok(found);
    }
    let Some(pager) = pager else {
        return Ok(found);
    };
    if found == pager.page_size() {
        let sql = format!(
            "SELECT count(1) FROM `{}` WHERE {}",
            schema.table_name(),
            predicate.sql_without_order()
        );
        debug!(target: "stratum::db", pool = %schema.pool_name(), %sql, "query");
        let rows = engine
            .registry
            .pool(schema.pool_name())?
            .query(&sql, predicate.params())?;
        let total = rows
            .first()
            .and_then(|row| row.first())
            .map(|value| value.canonical().parse::<usize>().unwrap_or(0))
            .unwrap_or(0);
        Ok(total)
    } else {
        Ok(pager.offset() + found)
    }
}

/// Load referenced entities for the requested ref columns and splice the
/// handles back. `"*"` expands to every declared reference. Warm-up is one
/// level deep; nested paths load through a second explicit call.
pub(crate) fn warm_up_references(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    handles: &[LoadedHandle],
    references: &[String],
) -> Result<()> {
    if handles.is_empty() || references.is_empty() {
        return Ok(());
    }
    let columns: Vec<String> = if references.iter().any(|name| name == "*") {
        schema
            .references()
            .iter()
            .map(|reference| reference.column.clone())
            .collect()
    } else {
        references.to_vec()
    };

    let mut entries: HashMap<(String, u64), Rc<dyn Any>> = HashMap::new();
    for column in &columns {
        let Some(reference) = schema
            .references()
            .iter()
            .find(|reference| reference.column == *column)
        else {
            return Err(OrmError::Validation(format!(
                "unknown reference '{column}' in {}",
                schema.entity_name()
            )));
        };
        let referenced = engine.registry.schema_required(&reference.entity)?;
        let mut ids = Vec::new();
        for handle in handles {
            if let DbValue::Uint(id) = handle.dynamic.borrow().get(column) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            continue;
        }
        let loaded = load_by_ids_dyn(engine, &referenced, &ids, true)?;
        for (id, loaded_handle) in loaded {
            entries.insert((reference.entity.clone(), id), loaded_handle.any);
        }
    }

    let source = HydrationSource { entries };
    for handle in handles {
        handle
            .dynamic
            .borrow_mut()
            .hydrate_references(&columns, &source);
    }
    Ok(())
}
