//! Error types and handling.

use thiserror::Error;

use crate::driver::DriverError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OrmError>;

/// Errors surfaced by the engine.
///
/// Validation and structural errors are raised synchronously from the call
/// that caused them; driver failures bubble up wrapped in [`OrmError::Driver`]
/// except for constraint violations, which are mapped to their typed
/// variants so callers can match on them.
#[derive(Debug, Error)]
pub enum OrmError {
    /// An entity type was used without being registered.
    #[error("entity '{name}' is not registered")]
    EntityNotRegistered { name: String },

    /// A pool, cache, queue or enum code is unknown to the registry.
    #[error("unknown {kind} '{code}'")]
    PoolNotRegistered { kind: &'static str, code: String },

    /// A schema tag or query definition could not be parsed.
    #[error("{0}")]
    Validation(String),

    /// A flush was rejected by a foreign-key constraint.
    ///
    /// The constraint is named `<pool>:<table>:<column>` after the
    /// referencing side.
    #[error("foreign key constraint '{constraint}' violated")]
    ForeignKey { constraint: String },

    /// A unique index rejected an insert or update.
    #[error("duplicate entry '{entry}' for key '{index}'")]
    DuplicateKey { index: String, entry: String },

    /// The requested operation is not available in this flush mode or for
    /// this field type.
    #[error("{0}")]
    NotSupported(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient failure from the SQL, KV or queue client.
    #[error("driver error: {0}")]
    Driver(DriverError),
}

impl From<DriverError> for OrmError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::ForeignKey { constraint } => Self::ForeignKey { constraint },
            DriverError::DuplicateKey { index, entry } => Self::DuplicateKey { index, entry },
            other => Self::Driver(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_errors_map_to_typed_variants() {
        let err: OrmError = DriverError::ForeignKey {
            constraint: "default:Child:Parent".to_string(),
        }
        .into();
        assert!(matches!(err, OrmError::ForeignKey { ref constraint } if constraint == "default:Child:Parent"));

        let err: OrmError = DriverError::DuplicateKey {
            index: "name".to_string(),
            entry: "John".to_string(),
        }
        .into();
        assert!(matches!(err, OrmError::DuplicateKey { .. }));

        let err: OrmError = DriverError::Other("gone away".to_string()).into();
        assert!(matches!(err, OrmError::Driver(_)));
    }

    #[test]
    fn error_messages_name_the_offender() {
        let err = OrmError::EntityNotRegistered {
            name: "Person".to_string(),
        };
        assert_eq!(err.to_string(), "entity 'Person' is not registered");

        let err = OrmError::PoolNotRegistered {
            kind: "mysql pool",
            code: "analytics".to_string(),
        };
        assert_eq!(err.to_string(), "unknown mysql pool 'analytics'");
    }
}
