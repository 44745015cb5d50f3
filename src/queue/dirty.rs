//! Dirty queue: a KV set of `entityName:<op>:id` members.
//!
//! The flush pipeline adds members for every subscribed change; a receiver
//! pops and parses them in batches. The set collapses duplicates, delivery
//! is at-least-once.

use std::sync::Arc;

use tracing::debug;

use crate::error::{OrmError, Result};
use crate::schema::{TableSchema, ValidatedRegistry};

/// One parsed dirty member.
pub struct DirtyData {
    pub schema: Arc<TableSchema>,
    pub id: u64,
    pub inserted: bool,
    pub updated: bool,
    pub deleted: bool,
}

/// Handler outcome re-queuing the members it could not process.
pub struct DirtyRejection {
    pub invalid: Vec<String>,
    pub error: OrmError,
}

pub struct DirtyReceiver {
    registry: Arc<ValidatedRegistry>,
    code: String,
}

impl DirtyReceiver {
    #[must_use]
    pub fn new(registry: Arc<ValidatedRegistry>, code: &str) -> Self {
        Self {
            registry,
            code: code.to_string(),
        }
    }

    /// Number of members waiting in the set.
    pub fn size(&self) -> Result<u64> {
        Ok(self.registry.dirty_queue_kv(&self.code)?.scard(&self.code)?)
    }

    /// Entity names subscribed to this queue code.
    #[must_use]
    pub fn entities(&self) -> Vec<String> {
        self.registry.entities_for_dirty_queue(&self.code)
    }

    /// Append `entityName:u:id` members for out-of-band invalidation.
    pub fn mark_dirty(&self, entity_name: &str, ids: &[u64]) -> Result<()> {
        let members: Vec<String> = ids
            .iter()
            .map(|id| format!("{entity_name}:u:{id}"))
            .collect();
        self.registry
            .dirty_queue_kv(&self.code)?
            .sadd(&self.code, &members)?;
        Ok(())
    }

    /// Pop up to `max` members, parse them and hand the batch to `handler`.
    /// Malformed or unregistered members are skipped. When the handler
    /// rejects, its invalid members return to the set and the error
    /// propagates. Returns whether anything was popped.
    pub fn digest(
        &self,
        max: u64,
        handler: impl FnOnce(&[DirtyData]) -> std::result::Result<(), DirtyRejection>,
    ) -> Result<bool> {
        let kv = self.registry.dirty_queue_kv(&self.code)?;
        let members = kv.spop(&self.code, max)?;
        if members.is_empty() {
            return Ok(false);
        }

        let mut batch = Vec::with_capacity(members.len());
        for member in &members {
            let parts: Vec<&str> = member.split(':').collect();
            if parts.len() != 3 {
                debug!(target: "stratum::queue", queue = %self.code, %member,
                    "skipping malformed dirty member");
                continue;
            }
            let Some(schema) = self.registry.get_table_schema(parts[0]) else {
                continue;
            };
            let Ok(id) = parts[2].parse::<u64>() else {
                continue;
            };
            batch.push(DirtyData {
                schema: Arc::clone(schema),
                id,
                inserted: parts[1] == "i",
                updated: parts[1] == "u",
                deleted: parts[1] == "d",
            });
        }

        match handler(&batch) {
            Ok(()) => Ok(true),
            Err(rejection) => {
                if !rejection.invalid.is_empty() {
                    kv.sadd(&self.code, &rejection.invalid)?;
                }
                Err(rejection.error)
            }
        }
    }
}
