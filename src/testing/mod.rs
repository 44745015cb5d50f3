//! In-memory driver implementations for tests and local development.
//!
//! [`MemoryDb`], [`MemoryKv`] and [`MemoryQueue`] implement the collaborator
//! traits of [`crate::driver`] well enough to exercise the whole engine:
//! flush pipeline, cache coherence, cached queries and queue dispatch.

mod db;
mod kv;
mod queue;

pub use db::{FkSpec, MemoryDb, TableSpec};
pub use kv::MemoryKv;
pub use queue::MemoryQueue;

use std::sync::Arc;

use crate::schema::{TableSchema, ValidatedRegistry};

impl TableSpec {
    /// Derive the table layout (columns, uniques, FK constraints and DDL)
    /// from a compiled schema.
    #[must_use]
    pub fn from_schema(registry: &ValidatedRegistry, schema: &TableSchema) -> Self {
        let foreign_keys = schema
            .references()
            .iter()
            .map(|reference| {
                let referenced_table = registry
                    .get_table_schema(&reference.entity)
                    .map_or_else(|| reference.entity.clone(), |s| s.table_name().to_string());
                FkSpec {
                    constraint: format!(
                        "{}:{}:{}",
                        schema.pool_name(),
                        schema.table_name(),
                        reference.column
                    ),
                    column: reference.column.clone(),
                    references: referenced_table,
                }
            })
            .collect();
        Self {
            name: schema.table_name().to_string(),
            columns: schema.column_names().to_vec(),
            uniques: schema
                .uniques()
                .iter()
                .map(|(name, columns)| (name.clone(), columns.clone()))
                .collect(),
            foreign_keys,
            ddl: schema.create_table_ddl(registry.enums(), &registry.table_for_entity()),
        }
    }
}

/// Register every entity table of `pool_code` (plus audit tables for
/// log-subscribed schemas) on the given in-memory driver. Call once per
/// pool after validating the registry.
pub fn create_schema_tables(registry: &Arc<ValidatedRegistry>, pool_code: &str, db: &MemoryDb) {
    let mut names: Vec<&String> = registry.schemas().keys().collect();
    names.sort();
    for name in names {
        let schema = &registry.schemas()[name];
        if schema.pool_name() != pool_code {
            continue;
        }
        db.register_table(TableSpec::from_schema(registry, schema));
        if schema.log_queue_code().is_some() {
            db.register_table(TableSpec::audit(schema.log_table()));
        }
    }
}
