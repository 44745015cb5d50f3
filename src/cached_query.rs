//! Cached-query index engine: materialized ID lists per declared predicate
//! and parameter tuple.
//!
//! The remote value is a KV list whose head element is the total row count
//! followed by the IDs (capped at the definition's `max`); the local tier
//! mirrors it as a [`CachedIds`] entry. Multi-row lists are only ever
//! rebuilt or deleted; `queryOne` keys are updated in place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CachedIds, LocalValue};
use crate::engine::Engine;
use crate::error::{OrmError, Result};
use crate::flush::OpKind;
use crate::loader::{self, LoadedHandle};
use crate::query::{Pager, Where};
use crate::schema::{CachedQueryDef, TableSchema};
use crate::value::DbValue;

/// Flush-side effect on one cached-query key.
pub(crate) enum QueryCacheOp {
    Del(String),
    /// In-place refresh of a unique `queryOne` key.
    SetOne {
        key: String,
        id: u64,
    },
}

/// Key parameters: the caller's arguments plus the implicit trailing
/// `FakeDelete = 0` parameter for fake-delete schemas.
fn key_params(def: &CachedQueryDef, arguments: &[DbValue]) -> Vec<DbValue> {
    let mut params = arguments.to_vec();
    if def.fake_param {
        params.push(DbValue::Uint(0));
    }
    params
}

fn def_required<'a>(schema: &'a TableSchema, index_name: &str) -> Result<&'a CachedQueryDef> {
    schema.cached_query(index_name).ok_or_else(|| {
        OrmError::Validation(format!(
            "unknown cached query '{index_name}' in {}",
            schema.entity_name()
        ))
    })
}

fn check_arguments(def: &CachedQueryDef, arguments: &[DbValue]) -> Result<()> {
    let placeholders = def.sql.matches('?').count();
    if placeholders != arguments.len() {
        return Err(OrmError::Validation(format!(
            "cached query '{}' expects {placeholders} arguments, got {}",
            def.name,
            arguments.len()
        )));
    }
    Ok(())
}

/// Read the cached ID list through the tiers, rebuilding it from the
/// database on a miss.
fn read_or_build_ids(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    def: &CachedQueryDef,
    arguments: &[DbValue],
) -> Result<CachedIds> {
    let key = schema.cache_key_query(&def.name, &key_params(def, arguments));

    let local = match schema.local_cache_code() {
        Some(code) => Some(engine.registry.local_cache(code)?),
        None => None,
    };
    if let Some(cache) = local {
        if let Some(LocalValue::IdList(ids)) = cache.get(&key) {
            return Ok((*ids).clone());
        }
    }

    let redis = match schema.redis_cache_code() {
        Some(code) => Some(engine.registry.kv(code)?),
        None => None,
    };
    if let Some(kv) = redis {
        let raw = kv.lrange(&key, 0, -1)?;
        if let Some(cached) = parse_id_list(&raw) {
            if let Some(cache) = local {
                cache.set(&key, LocalValue::IdList(Arc::new(cached.clone())));
            }
            return Ok(cached);
        }
    }

    // Miss in every tier: one SQL query bound to the parameters.
    let predicate = Where::new(def.sql.clone(), arguments.to_vec());
    let (ids, total) = loader::search_ids(
        engine,
        schema,
        &predicate,
        Some(&Pager::new(1, def.max)),
        true,
    )?;
    debug!(target: "stratum::cache", query = %def.name, total, "cached query rebuilt");
    let cached = CachedIds { total, ids };

    if let Some(kv) = redis {
        let mut values = Vec::with_capacity(cached.ids.len() + 1);
        values.push(cached.total.to_string());
        values.extend(cached.ids.iter().map(u64::to_string));
        kv.del(std::slice::from_ref(&key))?;
        kv.rpush(&key, &values)?;
    }
    if let Some(cache) = local {
        cache.set(&key, LocalValue::IdList(Arc::new(cached.clone())));
    }
    Ok(cached)
}

fn parse_id_list(raw: &[String]) -> Option<CachedIds> {
    let (head, tail) = raw.split_first()?;
    let total = head.parse::<usize>().ok()?;
    let mut ids = Vec::with_capacity(tail.len());
    for value in tail {
        ids.push(value.parse::<u64>().ok()?);
    }
    Some(CachedIds { total, ids })
}

/// Paged cached search; returns the total and the page's entities in
/// cached order.
pub(crate) fn cached_search(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    index_name: &str,
    pager: Option<&Pager>,
    arguments: &[DbValue],
) -> Result<(usize, Vec<LoadedHandle>)> {
    let def = def_required(schema, index_name)?.clone();
    if def.one {
        return Err(OrmError::Validation(format!(
            "cached query '{index_name}' is a queryOne definition"
        )));
    }
    check_arguments(&def, arguments)?;

    let cached = read_or_build_ids(engine, schema, &def, arguments)?;
    let default_pager = Pager::new(1, def.max);
    let pager = pager.copied().unwrap_or(default_pager);

    let offset = pager.offset();
    let end = offset.saturating_add(pager.page_size());
    let page_ids: Vec<u64> = if offset >= cached.ids.len() {
        if cached.total > cached.ids.len() {
            // Page lies beyond the cached prefix: serve it from the
            // database without touching the cache.
            let predicate = Where::new(def.sql.clone(), arguments.to_vec());
            let (ids, _) = loader::search_ids(engine, schema, &predicate, Some(&pager), false)?;
            ids
        } else {
            Vec::new()
        }
    } else {
        cached.ids[offset..end.min(cached.ids.len())].to_vec()
    };

    let mut loaded = loader::load_by_ids_dyn(engine, schema, &page_ids, true)?;
    let handles: Vec<LoadedHandle> = page_ids
        .iter()
        .filter_map(|id| loaded.remove(id))
        .collect();
    Ok((cached.total, handles))
}

/// Unique single-row cached lookup.
pub(crate) fn cached_search_one(
    engine: &Engine,
    schema: &Arc<TableSchema>,
    index_name: &str,
    arguments: &[DbValue],
) -> Result<Option<LoadedHandle>> {
    let def = def_required(schema, index_name)?.clone();
    if !def.one {
        return Err(OrmError::Validation(format!(
            "cached query '{index_name}' is not a queryOne definition"
        )));
    }
    check_arguments(&def, arguments)?;

    let cached = read_or_build_ids(engine, schema, &def, arguments)?;
    let Some(&id) = cached.ids.first() else {
        return Ok(None);
    };
    let mut loaded = loader::load_by_ids_dyn(engine, schema, &[id], true)?;
    Ok(loaded.remove(&id))
}

/// Compute the cache keys a flushed row invalidates, by evaluating each
/// definition's bound fields against the before and after column state.
///
/// Inserts and deletes touch every definition; updates only those whose
/// bound fields (or the implicit fake-delete parameter) changed.
pub(crate) fn invalidation_ops(
    schema: &TableSchema,
    op: OpKind,
    old_data: &HashMap<String, DbValue>,
    new_data: &HashMap<String, DbValue>,
    changed: &HashSet<String>,
    id: u64,
) -> Vec<QueryCacheOp> {
    let mut ops = Vec::new();
    for def in schema.cached_queries().values() {
        if op == OpKind::Update {
            let bound_changed = def.fields.iter().any(|field| changed.contains(field))
                || (def.fake_param && changed.contains("FakeDelete"));
            if !bound_changed {
                continue;
            }
        }

        let old_key = schema.cache_key_query(&def.name, &tuple_values(def, old_data));
        let new_key = schema.cache_key_query(&def.name, &tuple_values(def, new_data));

        match op {
            OpKind::Insert => {
                if def.one {
                    ops.push(QueryCacheOp::SetOne { key: new_key, id });
                } else {
                    ops.push(QueryCacheOp::Del(new_key));
                }
            }
            OpKind::Update => {
                if def.one {
                    let alive = !def.fake_param
                        || new_data
                            .get("FakeDelete")
                            .map(|value| value.canonical() != "1")
                            .unwrap_or(true);
                    let moved = new_key != old_key;
                    ops.push(QueryCacheOp::Del(old_key));
                    if alive {
                        ops.push(QueryCacheOp::SetOne { key: new_key, id });
                    } else if moved {
                        ops.push(QueryCacheOp::Del(new_key));
                    }
                } else {
                    if new_key != old_key {
                        ops.push(QueryCacheOp::Del(new_key));
                    }
                    ops.push(QueryCacheOp::Del(old_key));
                }
            }
            OpKind::Delete | OpKind::LogicalDelete => {
                if new_key != old_key {
                    ops.push(QueryCacheOp::Del(new_key));
                }
                ops.push(QueryCacheOp::Del(old_key));
            }
        }
    }
    ops
}

/// The definition's bound-field values from a column-state map, with the
/// row's actual `FakeDelete` value appended for fake-delete schemas.
fn tuple_values(def: &CachedQueryDef, data: &HashMap<String, DbValue>) -> Vec<DbValue> {
    let mut values: Vec<DbValue> = def
        .fields
        .iter()
        .map(|field| data.get(field).cloned().unwrap_or(DbValue::Null))
        .collect();
    if def.fake_param {
        let alive = data
            .get("FakeDelete")
            .cloned()
            .unwrap_or(DbValue::Bool(false));
        values.push(if alive.canonical() == "1" {
            DbValue::Uint(1)
        } else {
            DbValue::Uint(0)
        });
    }
    values
}
