//! Distributed lock facility over a KV pool.
//!
//! Exposed for user code and for queue receivers claiming exclusive
//! ownership; the flush pipeline itself never takes locks.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::KvClient;
use crate::error::Result;

pub struct Locker {
    kv: Arc<dyn KvClient>,
}

impl Locker {
    pub(crate) fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Try to acquire `key` for `ttl`. Returns `None` when another holder
    /// owns it.
    pub fn obtain(&self, key: &str, ttl: Duration) -> Result<Option<Lock>> {
        let acquired = self
            .kv
            .set_nx(key, "1", ttl.as_secs().max(1))?;
        if acquired {
            Ok(Some(Lock {
                kv: Arc::clone(&self.kv),
                key: key.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

/// An acquired lock; released explicitly or best-effort on drop.
pub struct Lock {
    kv: Arc<dyn KvClient>,
    key: String,
    released: bool,
}

impl Lock {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.kv.del(std::slice::from_ref(&self.key))?;
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.kv.del(std::slice::from_ref(&self.key));
        }
    }
}
