//! Dynamic column values and their canonical wire rendering.
//!
//! Every column value the engine moves between an entity, the database
//! driver and the cache tiers is a [`DbValue`]. Dirty detection and cache
//! serialization both go through [`DbValue::canonical`], so two values are
//! "the same" exactly when their canonical strings match.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::schema::ColumnKind;

/// Persisted date format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Persisted date-time format.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Uint(u64),
    Int(i64),
    Float32(f32),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Json(serde_json::Value),
    StringSet(Vec<String>),
}

impl DbValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical string rendering used for dirty comparison and cache values.
    ///
    /// Null and "empty" collapse to `""`; booleans render as `1`/`0` the way
    /// MySQL returns them.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Uint(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float32(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Self::Text(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Date(d) => d.format(DATE_FORMAT).to_string(),
            Self::DateTime(d) => d.format(DATE_TIME_FORMAT).to_string(),
            Self::Json(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::StringSet(values) => values.join(","),
        }
    }

    /// Parse a canonical cache string back into a value of the given column
    /// kind. The empty string means "null / zero" for every kind.
    #[must_use]
    pub fn from_cache_str(kind: &ColumnKind, raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Null;
        }
        match kind {
            ColumnKind::Uint | ColumnKind::Ref => {
                raw.parse::<u64>().map_or(Self::Null, Self::Uint)
            }
            ColumnKind::Int => raw.parse::<i64>().map_or(Self::Null, Self::Int),
            ColumnKind::Float32 => raw.parse::<f32>().map_or(Self::Null, Self::Float32),
            ColumnKind::Float64 => raw.parse::<f64>().map_or(Self::Null, Self::Float),
            ColumnKind::Bool => Self::Bool(raw == "1"),
            ColumnKind::String | ColumnKind::Enum => Self::Text(raw.to_string()),
            ColumnKind::Bytes => Self::Bytes(raw.as_bytes().to_vec()),
            ColumnKind::Json => {
                serde_json::from_str(raw).map_or(Self::Null, Self::Json)
            }
            ColumnKind::Date => {
                // A time-of-day suffix means the column carries a DATETIME.
                if raw.len() > 10 {
                    NaiveDateTime::parse_from_str(raw, DATE_TIME_FORMAT)
                        .map_or(Self::Null, Self::DateTime)
                } else {
                    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_or(Self::Null, Self::Date)
                }
            }
            ColumnKind::Set => {
                Self::StringSet(raw.split(',').map(str::to_string).collect())
            }
        }
    }
}

/// 32-bit FNV-1a over a byte slice. Used for the columns stamp and the
/// cached-query parameter hash.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
