//! Lazy queue: serialized flush plans replayed by a worker.
//!
//! A plan carries the SQL statements, the cache keys to invalidate and the
//! queue events to publish once the SQL lands. A failing plan is retried up
//! to [`MAX_ATTEMPTS`] times via the envelope counter, then dropped with an
//! error log so one bad record cannot wedge the loop.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::engine::Engine;
use crate::error::Result;
use crate::queue::log::{LOG_QUEUE, LogRecord};
use crate::queue::{ReceiverOptions, queue_name, run_loop};
use crate::value::DbValue;

/// Base queue name; non-default codes get a `_<code>` suffix.
pub(crate) const LAZY_QUEUE: &str = "orm_lazy";

/// Retry budget for one plan.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PlannedSql {
    pub pool: String,
    pub sql: String,
    pub params: Vec<DbValue>,
    /// Set for inserts: the replay must evict the entity keys of the IDs it
    /// just allocated (a negative sentinel may be caching their absence).
    #[serde(default)]
    pub insert_entity: Option<String>,
}

/// The serialized intent of one `flush_lazy` call.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct LazyPlan {
    #[serde(default)]
    pub attempts: u32,
    pub sql: Vec<PlannedSql>,
    /// (local cache code, key) pairs to evict.
    pub local_invalidate: Vec<(String, String)>,
    /// (kv code, key) pairs to delete.
    pub kv_invalidate: Vec<(String, String)>,
    /// (dirty queue code, member) pairs to publish.
    pub dirty: Vec<(String, String)>,
    /// (log queue code, record) pairs to publish.
    pub log: Vec<(String, LogRecord)>,
}

/// Replays lazy flush plans in order. Owns its engine, per the one-engine-
/// per-worker rule.
pub struct LazyReceiver {
    engine: Engine,
    code: String,
    options: ReceiverOptions,
}

impl LazyReceiver {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            code: "default".to_string(),
            options: ReceiverOptions::default(),
        }
    }

    #[must_use]
    pub fn with_code(engine: Engine, code: &str) -> Self {
        Self {
            engine,
            code: code.to_string(),
            options: ReceiverOptions::default(),
        }
    }

    pub fn set_heartbeat(&mut self, beat: impl FnMut() + 'static) {
        self.options.set_heartbeat(beat);
    }

    pub fn disable_loop(&mut self) {
        self.options.disable_loop();
    }

    pub fn set_max_loop_duration(&mut self, duration: std::time::Duration) {
        self.options.set_max_loop_duration(duration);
    }

    /// Drop every queued plan.
    pub fn purge(&self) -> Result<()> {
        let client = self.engine.registry().lazy_queue(&self.code)?;
        client.purge(&queue_name(LAZY_QUEUE, &self.code))?;
        Ok(())
    }

    /// Consume plans until the queue drains (single-drain mode) or the loop
    /// budget elapses. Per-record failures never stop the loop.
    pub fn digest(&mut self) -> Result<()> {
        let client = self.engine.registry().lazy_queue(&self.code)?.clone();
        let queue = queue_name(LAZY_QUEUE, &self.code);
        let engine = &mut self.engine;
        let mut step = || -> bool {
            let payload = match client.pop(&queue) {
                Ok(Some(payload)) => payload,
                Ok(None) => return false,
                Err(err) => {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        "lazy pop failed");
                    return false;
                }
            };
            let mut plan: LazyPlan = match serde_json::from_slice(&payload) {
                Ok(plan) => plan,
                Err(err) => {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        "dropping unparsable lazy plan");
                    return true;
                }
            };
            if let Err(err) = replay(engine, &plan) {
                plan.attempts += 1;
                if plan.attempts >= MAX_ATTEMPTS {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        attempts = plan.attempts, "dropping lazy plan after retry budget");
                } else {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        attempts = plan.attempts, "requeueing failed lazy plan");
                    match serde_json::to_vec(&plan) {
                        Ok(bytes) => {
                            if let Err(push_err) = client.push(&queue, &bytes) {
                                error!(target: "stratum::queue", queue = %queue,
                                    error = %push_err, "lazy requeue failed");
                            }
                        }
                        Err(encode_err) => {
                            error!(target: "stratum::queue", queue = %queue,
                                error = %encode_err, "lazy requeue encode failed");
                        }
                    }
                }
            }
            true
        };
        run_loop(&mut self.options, &mut step);
        Ok(())
    }
}

/// SQL in order, then cache invalidations, then queue publishes.
fn replay(engine: &mut Engine, plan: &LazyPlan) -> Result<()> {
    for statement in &plan.sql {
        debug!(target: "stratum::db", pool = %statement.pool, sql = %statement.sql,
            "lazy replay");
        let result = engine
            .registry()
            .pool(&statement.pool)?
            .execute(&statement.sql, &statement.params)?;
        if let Some(entity) = &statement.insert_entity {
            let schema = engine.registry().schema_required(entity)?;
            let keys: Vec<String> = (0..result.rows_affected)
                .map(|offset| schema.cache_key(result.last_insert_id + offset))
                .collect();
            if let Some(code) = schema.redis_cache_code() {
                engine.registry().kv(code)?.del(&keys)?;
            }
            if let Some(code) = schema.local_cache_code() {
                engine.registry().local_cache(code)?.remove_many(&keys);
            }
        }
    }
    for (code, key) in &plan.kv_invalidate {
        engine
            .registry()
            .kv(code)?
            .del(std::slice::from_ref(key))?;
    }
    for (code, key) in &plan.local_invalidate {
        engine.registry().local_cache(code)?.remove(key);
    }
    for (code, member) in &plan.dirty {
        engine
            .registry()
            .dirty_queue_kv(code)?
            .sadd(code, std::slice::from_ref(member))?;
    }
    for (code, record) in &plan.log {
        let payload = serde_json::to_vec(record)?;
        engine
            .registry()
            .log_queue(code)?
            .push(&queue_name(LOG_QUEUE, code), &payload)?;
    }
    Ok(())
}
