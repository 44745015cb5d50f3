//! Dirty detection: minimal column deltas against the `db_data` baseline.

use crate::entity::Entity;
use crate::schema::TableSchema;
use crate::value::DbValue;

/// One changed column with its old and new value.
#[derive(Debug, Clone)]
pub(crate) struct ColumnChange {
    pub column: String,
    pub old: DbValue,
    pub new: DbValue,
}

/// Changed columns only, canonical comparison. The baseline value for a
/// column missing from `db_data` is NULL.
pub(crate) fn changed_columns(schema: &TableSchema, entity: &dyn Entity) -> Vec<ColumnChange> {
    let state = entity.state();
    let mut changes = Vec::new();
    for column in schema.column_names().iter().skip(1) {
        let new = entity.get(column);
        let old = state.db_value(column).cloned().unwrap_or(DbValue::Null);
        if new.canonical() != old.canonical() {
            changes.push(ColumnChange {
                column: column.clone(),
                old,
                new,
            });
        }
    }
    changes
}

/// Whether a flush would touch this entity: pending insert, pending delete
/// or at least one dirty column.
pub(crate) fn is_dirty(schema: &TableSchema, entity: &dyn Entity) -> bool {
    if entity.id() == 0 || !entity.state().is_loaded() {
        return true;
    }
    if entity.state().is_marked_to_delete() {
        return true;
    }
    !changed_columns(schema, entity).is_empty()
}

/// Every non-ID column's current value, for insert binds.
pub(crate) fn full_bind(schema: &TableSchema, entity: &dyn Entity) -> Vec<(String, DbValue)> {
    schema
        .column_names()
        .iter()
        .skip(1)
        .map(|column| (column.clone(), entity.get(column)))
        .collect()
}
