//! Entity trait, per-entity ORM state and reference handles.
//!
//! Entities describe themselves through a static [`EntityDescriptor`] and a
//! hand-compiled accessor table (`get`/`set` keyed by column name); the
//! engine never reflects over field layouts at run time.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::Result;
use crate::query::Where;
use crate::value::DbValue;

/// Shared handle to an entity, as stored in the engine's tracked set.
pub type Tracked<E> = Rc<RefCell<E>>;

/// Type-erased tracked handle.
pub type TrackedDyn = Rc<RefCell<dyn Entity>>;

/// Per-entity ORM bookkeeping.
///
/// `db_data` is the ground truth of what the database held when the entity
/// was last observed; a column is dirty iff its current value differs from
/// the snapshot after canonicalization.
#[derive(Debug, Default)]
pub struct OrmState {
    pub(crate) db_data: HashMap<String, DbValue>,
    pub(crate) loaded: bool,
    pub(crate) initialized: bool,
    pub(crate) delete: bool,
    pub(crate) force_delete: bool,
    pub(crate) on_duplicate_key_update: Option<Where>,
    pub(crate) log_meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl OrmState {
    /// Whether the entity carries a database snapshot.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether the entity is marked for deletion on the next flush.
    #[must_use]
    pub const fn is_marked_to_delete(&self) -> bool {
        self.delete
    }

    /// The last observed database value for a column, if any.
    #[must_use]
    pub fn db_value(&self, column: &str) -> Option<&DbValue> {
        self.db_data.get(column)
    }
}

/// A to-one reference stored as the referenced entity's ID.
///
/// The handle reads its ID through the loaded entity when one is attached,
/// so auto-increment write-back on the referenced side is visible to
/// dependents without any extra bookkeeping.
pub struct Ref<E> {
    id: u64,
    loaded: Option<Tracked<E>>,
}

impl<E: Entity> Ref<E> {
    #[must_use]
    pub const fn none() -> Self {
        Self { id: 0, loaded: None }
    }

    #[must_use]
    pub const fn by_id(id: u64) -> Self {
        Self { id, loaded: None }
    }

    /// Point at a live entity handle (saved or not).
    #[must_use]
    pub fn to(entity: &Tracked<E>) -> Self {
        Self {
            id: entity.borrow().id(),
            loaded: Some(Rc::clone(entity)),
        }
    }

    /// The referenced ID; 0 means "no reference yet".
    #[must_use]
    pub fn id(&self) -> u64 {
        match &self.loaded {
            Some(entity) => entity.borrow().id(),
            None => self.id,
        }
    }

    /// Whether the reference points at anything (by ID or by handle).
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.loaded.is_some() || self.id != 0
    }

    /// The loaded entity handle, when hydration has run.
    #[must_use]
    pub const fn get(&self) -> Option<&Tracked<E>> {
        self.loaded.as_ref()
    }

    pub fn set_loaded(&mut self, entity: Tracked<E>) {
        self.id = entity.borrow().id();
        self.loaded = Some(entity);
    }

    /// The column value this reference persists as (NULL when unset).
    #[must_use]
    pub fn column_value(&self) -> DbValue {
        match self.id() {
            0 => DbValue::Null,
            id => DbValue::Uint(id),
        }
    }

    /// Apply a column value coming from the database or a cache tier.
    pub fn apply_column_value(&mut self, value: &DbValue) {
        self.loaded = None;
        self.id = match value {
            DbValue::Uint(id) => *id,
            DbValue::Int(id) if *id > 0 => u64::try_from(*id).unwrap_or(0),
            _ => 0,
        };
    }

    /// The handle when it points at an entity that was never persisted.
    /// Entity impls surface these through
    /// [`Entity::pending_references`].
    #[must_use]
    pub fn unsaved_handle(&self) -> Option<Tracked<E>> {
        match &self.loaded {
            Some(entity) if entity.borrow().id() == 0 => Some(Rc::clone(entity)),
            _ => None,
        }
    }
}

impl<E> Default for Ref<E> {
    fn default() -> Self {
        Self { id: 0, loaded: None }
    }
}

impl<E> Clone for Ref<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            loaded: self.loaded.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for Ref<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id())
            .field("loaded", &self.loaded.is_some())
            .finish()
    }
}

/// Static type of a declared field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Uint { bits: u8 },
    Int { bits: u8 },
    Float32,
    Float64,
    Bool,
    String,
    Bytes,
    Json,
    Date,
    Enum,
    Set,
    Ref { entity: &'static str },
    Embedded { fields: &'static [FieldDef] },
}

/// One declared field: name, static kind and its schema tag
/// (semicolon-separated `key[=value]` pairs).
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    pub tag: &'static str,
}

/// A declared cached query. The template binds parameters with `:Field`
/// markers; `tag` may carry `max=<n>` for multi-row queries.
#[derive(Debug, Clone, Copy)]
pub struct QueryDef {
    pub name: &'static str,
    pub one: bool,
    pub template: &'static str,
    pub tag: &'static str,
}

/// Two views of one freshly allocated entity: the engine works through
/// `dynamic`, typed reference hydration downcasts through `any`.
pub struct CreatedEntity {
    pub dynamic: TrackedDyn,
    pub any: Rc<dyn Any>,
}

/// Static description of an entity type, compiled into a
/// [`TableSchema`](crate::schema::TableSchema) at registry validation.
pub struct EntityDescriptor {
    pub name: &'static str,
    /// Entity-level tag: `mysql`, `table`, `localCache`, `redisCache`,
    /// `dirty`, `log` keys.
    pub entity_tag: &'static str,
    pub fields: &'static [FieldDef],
    pub queries: &'static [QueryDef],
    pub create: fn() -> CreatedEntity,
}

/// Loaded reference entities handed to [`Entity::hydrate_references`],
/// keyed by entity name and ID.
pub struct HydrationSource {
    pub(crate) entries: HashMap<(String, u64), Rc<dyn Any>>,
}

impl HydrationSource {
    /// Fetch a loaded entity of type `E` by ID.
    #[must_use]
    pub fn fetch<E: Entity>(&self, id: u64) -> Option<Tracked<E>> {
        let key = (E::descriptor().name.to_string(), id);
        let any = self.entries.get(&key)?;
        Rc::clone(any).downcast::<RefCell<E>>().ok()
    }
}

/// A persistable record with a compiled accessor table.
///
/// `get`/`set` address flattened columns by name (embedded structs use the
/// `ParentChild` column convention). Lifecycle hooks are optional; the
/// engine probes them at defined points: `set_defaults` on first track,
/// `validate` before insert/update binds in a sync flush, `after_saved`
/// after a successful insert or update.
pub trait Entity: Any {
    fn descriptor() -> &'static EntityDescriptor
    where
        Self: Sized;

    /// Object-safe descriptor accessor.
    fn descriptor_of(&self) -> &'static EntityDescriptor;

    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    /// Current value of a flattened column.
    fn get(&self, column: &str) -> DbValue;

    /// Apply a value to a flattened column.
    fn set(&mut self, column: &str, value: DbValue) -> Result<()>;

    fn state(&self) -> &OrmState;

    fn state_mut(&mut self) -> &mut OrmState;

    /// Handles of referenced entities that were never persisted; the sync
    /// flush pulls them into the same batch, parents first.
    fn pending_references(&self) -> Vec<TrackedDyn> {
        Vec::new()
    }

    /// Splice loaded reference handles back onto typed `Ref` fields.
    fn hydrate_references(&mut self, _refs: &[String], _source: &HydrationSource) {}

    fn set_defaults(&mut self) {}

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn after_saved(&mut self, _engine: &mut Engine) {}
}

/// Pointer identity for tracked-set deduplication.
pub(crate) fn same_entity(a: &TrackedDyn, b: &TrackedDyn) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a).cast::<u8>(),
        Rc::as_ptr(b).cast::<u8>(),
    )
}
