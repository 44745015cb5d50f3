//! Per-scope engine handle: the tracked set and every user-facing
//! operation.
//!
//! An engine is single-threaded by construction (it deals in `Rc`
//! handles); create one per request or worker from the shared
//! [`ValidatedRegistry`]. Schemas, drivers and the local cache containers
//! are shared; the tracked set is not.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::cache::LocalCache;
use crate::cached_query;
use crate::dirty;
use crate::driver::{KvClient, SqlDriver};
use crate::entity::{Entity, Tracked, TrackedDyn, same_entity};
use crate::error::{OrmError, Result};
use crate::flush;
use crate::loader::{self, LoadedHandle};
use crate::lock::Locker;
use crate::query::{Pager, Where};
use crate::schema::{Alter, TableSchema, ValidatedRegistry};
use crate::value::DbValue;

pub struct Engine {
    pub(crate) registry: Arc<ValidatedRegistry>,
    pub(crate) tracked: Vec<TrackedDyn>,
}

impl Engine {
    pub(crate) fn new(registry: Arc<ValidatedRegistry>) -> Self {
        Self {
            registry,
            tracked: Vec::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.registry
    }

    /// Register an entity for the next flush. Duplicate handles collapse by
    /// pointer identity; first track runs `set_defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::EntityNotRegistered`] when the entity type is
    /// unknown to the registry.
    pub fn track<E: Entity>(&mut self, entity: &Tracked<E>) -> Result<()> {
        let handle: TrackedDyn = Rc::clone(entity) as TrackedDyn;
        self.track_dyn(handle)
    }

    /// Wrap a fresh entity into a tracked handle.
    pub fn track_new<E: Entity>(&mut self, entity: E) -> Result<Tracked<E>> {
        let handle = Rc::new(RefCell::new(entity));
        self.track(&handle)?;
        Ok(handle)
    }

    pub(crate) fn track_dyn(&mut self, handle: TrackedDyn) -> Result<()> {
        self.init_state(&handle)?;
        if !self.tracked.iter().any(|known| same_entity(known, &handle)) {
            self.tracked.push(handle);
        }
        Ok(())
    }

    /// Lazily initialize ORM state and run `set_defaults` once.
    pub(crate) fn init_state(&self, handle: &TrackedDyn) -> Result<Arc<TableSchema>> {
        let name = handle.borrow().descriptor_of().name;
        let schema = self.registry.schema_required(name)?;
        let mut entity = handle.borrow_mut();
        if !entity.state().initialized {
            entity.state_mut().initialized = true;
            entity.set_defaults();
        }
        Ok(schema)
    }

    /// Mark for deletion on the next flush. Under fake delete this flips the
    /// `FakeDelete` column instead of scheduling a physical delete.
    pub fn mark_to_delete<E: Entity>(&mut self, entity: &Tracked<E>) -> Result<()> {
        self.track(entity)?;
        let schema = self.schema_for::<E>()?;
        let mut entity = entity.borrow_mut();
        entity.state_mut().delete = true;
        if schema.has_fake_delete() {
            entity.set("FakeDelete", DbValue::Bool(true))?;
        }
        Ok(())
    }

    /// Force a physical delete even when the schema uses fake delete.
    pub fn force_mark_to_delete<E: Entity>(&mut self, entity: &Tracked<E>) -> Result<()> {
        self.track(entity)?;
        let mut entity = entity.borrow_mut();
        entity.state_mut().delete = true;
        entity.state_mut().force_delete = true;
        Ok(())
    }

    /// Pure dirty check; no side effects.
    pub fn is_dirty<E: Entity>(&self, entity: &E) -> Result<bool> {
        let schema = self.schema_for::<E>()?;
        Ok(dirty::is_dirty(&schema, entity))
    }

    /// Drop the tracked set without flushing.
    pub fn clear_tracked_entities(&mut self) {
        self.tracked.clear();
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Attach an `ON DUPLICATE KEY UPDATE` clause to a pending insert.
    pub fn set_on_duplicate_key_update<E: Entity>(
        &mut self,
        clause: Where,
        entity: &Tracked<E>,
    ) -> Result<()> {
        self.track(entity)?;
        entity.borrow_mut().state_mut().on_duplicate_key_update = Some(clause);
        Ok(())
    }

    /// Attach audit metadata carried into the log queue entry.
    pub fn set_log_meta<E: Entity>(
        &mut self,
        entity: &Tracked<E>,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.track(entity)?;
        let mut entity = entity.borrow_mut();
        entity
            .state_mut()
            .log_meta
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Synchronous flush: SQL now, then cache invalidations and queue
    /// publishes, in that order.
    pub fn flush(&mut self) -> Result<()> {
        flush::flush_sync(self)
    }

    /// Sync flush with constraint failures guaranteed as typed
    /// [`ForeignKey`](OrmError::ForeignKey) /
    /// [`DuplicateKey`](OrmError::DuplicateKey) errors.
    pub fn flush_with_check(&mut self) -> Result<()> {
        flush::flush_sync(self)
    }

    /// Serialize the flush plan into the lazy queue and return immediately.
    pub fn flush_lazy(&mut self) -> Result<()> {
        flush::flush_lazy(self)
    }

    /// Write redis-bound entities straight to the cache and defer their SQL
    /// to the dirty-queue worker; everything else flushes synchronously.
    pub fn flush_in_cache(&mut self) -> Result<()> {
        flush::flush_in_cache(self)
    }

    /// Multi-tier load by primary key. Logically deleted rows are returned
    /// with their `FakeDelete` flag set.
    pub fn load_by_id<E: Entity>(
        &mut self,
        id: u64,
        references: &[&str],
    ) -> Result<Option<Tracked<E>>> {
        let schema = self.schema_for::<E>()?;
        let mut loaded = loader::load_by_ids_dyn(self, &schema, &[id], true)?;
        let Some(handle) = loaded.remove(&id) else {
            return Ok(None);
        };
        if !references.is_empty() {
            loader::warm_up_references(
                self,
                &schema,
                std::slice::from_ref(&handle),
                &to_strings(references),
            )?;
        }
        Ok(Some(downcast::<E>(handle)?))
    }

    /// Batched multi-tier load; result order follows `ids`, missing rows
    /// are `None`.
    pub fn load_by_ids<E: Entity>(
        &mut self,
        ids: &[u64],
        references: &[&str],
    ) -> Result<Vec<Option<Tracked<E>>>> {
        let schema = self.schema_for::<E>()?;
        let mut loaded = loader::load_by_ids_dyn(self, &schema, ids, true)?;
        if !references.is_empty() {
            let handles: Vec<LoadedHandle> = loaded.values().cloned().collect();
            loader::warm_up_references(self, &schema, &handles, &to_strings(references))?;
        }
        ids.iter()
            .map(|id| loaded.remove(id).map(downcast::<E>).transpose())
            .collect()
    }

    /// Raw predicate search straight against the database (no cache tiers).
    pub fn search<E: Entity>(
        &mut self,
        predicate: &Where,
        pager: Option<Pager>,
        references: &[&str],
    ) -> Result<Vec<Tracked<E>>> {
        let (_, rows) = self.search_with_count(predicate, pager, references)?;
        Ok(rows)
    }

    pub fn search_with_count<E: Entity>(
        &mut self,
        predicate: &Where,
        pager: Option<Pager>,
        references: &[&str],
    ) -> Result<(usize, Vec<Tracked<E>>)> {
        let schema = self.schema_for::<E>()?;
        let (handles, total) =
            loader::search_handles(self, &schema, predicate, pager.as_ref(), true)?;
        if !references.is_empty() {
            loader::warm_up_references(self, &schema, &handles, &to_strings(references))?;
        }
        let rows = handles
            .into_iter()
            .map(downcast::<E>)
            .collect::<Result<Vec<_>>>()?;
        Ok((total, rows))
    }

    pub fn search_one<E: Entity>(&mut self, predicate: &Where) -> Result<Option<Tracked<E>>> {
        let schema = self.schema_for::<E>()?;
        let (mut handles, _) = loader::search_handles(
            self,
            &schema,
            predicate,
            Some(&Pager::new(1, 1)),
            false,
        )?;
        handles.pop().map(downcast::<E>).transpose()
    }

    pub fn search_ids<E: Entity>(
        &mut self,
        predicate: &Where,
        pager: Option<Pager>,
    ) -> Result<Vec<u64>> {
        let schema = self.schema_for::<E>()?;
        let (ids, _) = loader::search_ids(self, &schema, predicate, pager.as_ref(), false)?;
        Ok(ids)
    }

    pub fn search_ids_with_count<E: Entity>(
        &mut self,
        predicate: &Where,
        pager: Option<Pager>,
    ) -> Result<(usize, Vec<u64>)> {
        let schema = self.schema_for::<E>()?;
        let (ids, total) = loader::search_ids(self, &schema, predicate, pager.as_ref(), true)?;
        Ok((total, ids))
    }

    /// Paged read over a declared cached query's materialized ID list.
    pub fn cached_search<E: Entity>(
        &mut self,
        index_name: &str,
        pager: Option<Pager>,
        arguments: Vec<DbValue>,
        references: &[&str],
    ) -> Result<(usize, Vec<Tracked<E>>)> {
        let schema = self.schema_for::<E>()?;
        let (total, handles) = cached_query::cached_search(
            self,
            &schema,
            index_name,
            pager.as_ref(),
            &arguments,
        )?;
        if !references.is_empty() {
            loader::warm_up_references(self, &schema, &handles, &to_strings(references))?;
        }
        let rows = handles
            .into_iter()
            .map(downcast::<E>)
            .collect::<Result<Vec<_>>>()?;
        Ok((total, rows))
    }

    /// Single-row cached query lookup.
    pub fn cached_search_one<E: Entity>(
        &mut self,
        index_name: &str,
        arguments: Vec<DbValue>,
    ) -> Result<Option<Tracked<E>>> {
        let schema = self.schema_for::<E>()?;
        let handle = cached_query::cached_search_one(self, &schema, index_name, &arguments)?;
        handle.map(downcast::<E>).transpose()
    }

    /// Drop entity-by-ID cache keys so the next read refills from the DB.
    pub fn clear_by_ids<E: Entity>(&mut self, ids: &[u64]) -> Result<()> {
        let schema = self.schema_for::<E>()?;
        let keys: Vec<String> = ids.iter().map(|id| schema.cache_key(*id)).collect();
        if let Some(code) = schema.local_cache_code() {
            self.registry.local_cache(code)?.remove_many(&keys);
        }
        if let Some(code) = schema.redis_cache_code() {
            self.registry.kv(code)?.del(&keys)?;
        }
        Ok(())
    }

    /// Ordered safe/unsafe DDL statements from the schema diff.
    pub fn get_alters(&self) -> Result<Vec<Alter>> {
        crate::schema::get_alters(self)
    }

    pub fn db(&self, code: &str) -> Result<Arc<dyn SqlDriver>> {
        Ok(Arc::clone(self.registry.pool(code)?))
    }

    pub fn kv(&self, code: &str) -> Result<Arc<dyn KvClient>> {
        Ok(Arc::clone(self.registry.kv(code)?))
    }

    pub fn local_cache(&self, code: &str) -> Result<Arc<LocalCache>> {
        Ok(Arc::clone(self.registry.local_cache(code)?))
    }

    /// Distributed lock facility backed by a KV pool.
    pub fn locker(&self, code: &str) -> Result<Locker> {
        Ok(Locker::new(Arc::clone(self.registry.locker_kv(code)?)))
    }

    pub(crate) fn schema_for<E: Entity>(&self) -> Result<Arc<TableSchema>> {
        self.registry.schema_required(E::descriptor().name)
    }
}

fn to_strings(references: &[&str]) -> Vec<String> {
    references.iter().map(|&name| name.to_string()).collect()
}

pub(crate) fn downcast<E: Entity>(handle: LoadedHandle) -> Result<Tracked<E>> {
    handle
        .any
        .downcast::<RefCell<E>>()
        .map_err(|_| OrmError::EntityNotRegistered {
            name: E::descriptor().name.to_string(),
        })
}
