//! Log queue: audit entries inserted into per-table `_log_` tables.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::Engine;
use crate::error::Result;
use crate::queue::{ReceiverOptions, queue_name, run_loop};
use crate::value::DbValue;

/// Base queue name; non-default codes get a `_<code>` suffix.
pub(crate) const LOG_QUEUE: &str = "orm_log";

/// One audit entry as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub pool_name: String,
    pub table_name: String,
    pub id: u64,
    /// `YYYY-MM-DD HH:MM:SS`.
    pub updated: String,
    pub meta: Option<serde_json::Value>,
    pub before: Option<serde_json::Value>,
    pub changes: Option<serde_json::Value>,
}

/// Consumes log records and inserts audit rows. Owns its engine.
pub struct LogReceiver {
    engine: Engine,
    code: String,
    options: ReceiverOptions,
    logger: Option<Box<dyn FnMut(&LogRecord)>>,
}

impl LogReceiver {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            code: "default".to_string(),
            options: ReceiverOptions::default(),
            logger: None,
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

    /// Callback invoked after each stored record.
    pub fn set_logger(&mut self, logger: impl FnMut(&LogRecord) + 'static) {
        self.logger = Some(Box::new(logger));
    }

    pub fn purge(&self) -> Result<()> {
        let client = self.engine.registry().log_queue(&self.code)?;
        client.purge(&queue_name(LOG_QUEUE, &self.code))?;
        Ok(())
    }

    /// Consume records until the queue drains (single-drain mode) or the
    /// loop budget elapses; bad records are logged and skipped.
    pub fn digest(&mut self) -> Result<()> {
        let client = self.engine.registry().log_queue(&self.code)?.clone();
        let queue = queue_name(LOG_QUEUE, &self.code);
        let engine = &mut self.engine;
        let logger = &mut self.logger;
        let mut step = || -> bool {
            let payload = match client.pop(&queue) {
                Ok(Some(payload)) => payload,
                Ok(None) => return false,
                Err(err) => {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        "log pop failed");
                    return false;
                }
            };
            let record: LogRecord = match serde_json::from_slice(&payload) {
                Ok(record) => record,
                Err(err) => {
                    error!(target: "stratum::queue", queue = %queue, error = %err,
                        "dropping unparsable log record");
                    return true;
                }
            };
            if let Err(err) = store(engine, &record) {
                error!(target: "stratum::queue", queue = %queue, error = %err,
                    table = %record.table_name, "audit insert failed");
                return true;
            }
            if let Some(logger) = logger {
                logger(&record);
            }
            true
        };
        run_loop(&mut self.options, &mut step);
        Ok(())
    }
}

fn store(engine: &mut Engine, record: &LogRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO `{}`(`entity_id`,`added_at`,`meta`,`before`,`changes`) VALUES (?,?,?,?,?)",
        record.table_name
    );
    let params = vec![
        DbValue::Uint(record.id),
        DbValue::Text(record.updated.clone()),
        json_param(record.meta.as_ref()),
        json_param(record.before.as_ref()),
        json_param(record.changes.as_ref()),
    ];
    engine.registry().pool(&record.pool_name)?.execute(&sql, &params)?;
    Ok(())
}

fn json_param(value: Option<&serde_json::Value>) -> DbValue {
    value.map_or(DbValue::Null, |value| DbValue::Json(value.clone()))
}
