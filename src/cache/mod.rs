//! Cache coherence: key schemes, value encoding and the negative sentinel.
//!
//! Key and value formats are part of the persisted wire contract:
//!
//! - entity by ID: `<cachePrefix><columnsStamp>:<ID>` holding a JSON array
//!   of canonical column strings (`ID` excluded, null rendered as `""`);
//! - cached query: `<cachePrefix>_<name>_<fnv32(params)>` holding a list
//!   whose head is the total row count followed by the IDs;
//! - the negative sentinel is the literal string `nil`.

mod local;

pub use local::{CachedIds, LocalCache, LocalValue};

use crate::entity::Entity;
use crate::schema::TableSchema;

/// Negative cache marker: "known not present".
pub const SENTINEL: &str = "nil";

/// TTL for remote negative sentinels, in seconds.
pub const SENTINEL_TTL_SECS: u64 = 60;

/// Serialize the entity's post-commit column state (from `db_data`) into
/// the cache row: canonical strings, schema column order, `ID` skipped.
#[must_use]
pub fn build_cache_row(schema: &TableSchema, entity: &dyn Entity) -> Vec<String> {
    let state = entity.state();
    schema
        .column_names()
        .iter()
        .skip(1)
        .map(|column| {
            state
                .db_value(column)
                .map(crate::value::DbValue::canonical)
                .unwrap_or_default()
        })
        .collect()
}

/// JSON-encode a cache row for the remote tier.
#[must_use]
pub fn encode_row(row: &[String]) -> String {
    serde_json::to_string(row).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a remote cache value; `None` means the value is unparsable and
/// the reader must fall through to the database.
#[must_use]
pub fn decode_row(raw: &str, expected_columns: usize) -> Option<Vec<String>> {
    let row: Vec<String> = serde_json::from_str(raw).ok()?;
    if row.len() == expected_columns {
        Some(row)
    } else {
        None
    }
}
