//! External collaborator interfaces: SQL driver, KV cache client and
//! durable queue client.
//!
//! The engine consumes these traits but does not ship production
//! implementations; [`crate::testing`] provides in-memory ones for the test
//! suite and local development.

use thiserror::Error;

use crate::value::DbValue;

/// Result alias for driver-facing calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// One result row, values in selected-column order.
pub type Row = Vec<DbValue>;

/// Failures reported by a driver. Implementations are expected to map
/// native constraint violations onto the structured variants so the engine
/// can type them.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("foreign key constraint '{constraint}' violated")]
    ForeignKey { constraint: String },

    #[error("duplicate entry '{entry}' for key '{index}'")]
    DuplicateKey { index: String, entry: String },

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    /// First auto-increment ID assigned by the statement (0 when none).
    pub last_insert_id: u64,
    pub rows_affected: u64,
}

/// Connection-pool limits computed by the registry's auto-tuning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime_secs: u64,
}

/// A MySQL-compatible SQL driver with parameterized execute/query.
///
/// Shared across engines; implementations synchronize internally.
pub trait SqlDriver: Send + Sync {
    fn execute(&self, sql: &str, params: &[DbValue]) -> DriverResult<ExecResult>;

    fn query(&self, sql: &str, params: &[DbValue]) -> DriverResult<Vec<Row>>;

    /// Apply auto-tuned pool limits. Drivers without a pool ignore this.
    fn configure_pool(&self, _limits: PoolLimits) {}
}

/// A remote KV store offering strings, sets and lists. A sharded ring, when
/// used, lives entirely behind this trait.
pub trait KvClient: Send + Sync {
    fn get(&self, key: &str) -> DriverResult<Option<String>>;

    fn mget(&self, keys: &[String]) -> DriverResult<Vec<Option<String>>>;

    fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> DriverResult<()>;

    fn mset(&self, pairs: &[(String, String)]) -> DriverResult<()>;

    fn del(&self, keys: &[String]) -> DriverResult<()>;

    /// SET-if-absent with a TTL; the distributed lock primitive.
    fn set_nx(&self, key: &str, value: &str, ttl_seconds: u64) -> DriverResult<bool>;

    fn sadd(&self, key: &str, members: &[String]) -> DriverResult<u64>;

    fn spop(&self, key: &str, count: u64) -> DriverResult<Vec<String>>;

    fn scard(&self, key: &str) -> DriverResult<u64>;

    fn rpush(&self, key: &str, values: &[String]) -> DriverResult<u64>;

    /// Inclusive range read; negative indexes count from the tail.
    fn lrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<String>>;

    fn llen(&self, key: &str) -> DriverResult<u64>;
}

/// A durable message queue with at-least-once delivery. Retry accounting is
/// carried in the payload envelope by the receivers.
pub trait QueueClient: Send + Sync {
    fn push(&self, queue: &str, payload: &[u8]) -> DriverResult<()>;

    fn pop(&self, queue: &str) -> DriverResult<Option<Vec<u8>>>;

    fn len(&self, queue: &str) -> DriverResult<u64>;

    /// Drop every pending message.
    fn purge(&self, queue: &str) -> DriverResult<()>;
}
