//! In-process LRU cache container.
//!
//! Containers are shared across engines within one process and synchronized
//! with a per-container lock. An optional TTL is container-wide: when a read
//! observes expiry the whole container is cleared and its epoch reset.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

/// IDs materialized for one cached-query parameter tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIds {
    pub total: usize,
    pub ids: Vec<u64>,
}

/// Value stored in a local container.
#[derive(Debug, Clone)]
pub enum LocalValue {
    /// Known-absent marker, the local twin of the remote `"nil"` sentinel.
    Sentinel,
    /// Serialized entity row: canonical column strings, `ID` excluded.
    Row(Arc<Vec<String>>),
    /// Cached-query ID list.
    IdList(Arc<CachedIds>),
}

struct Inner {
    lru: LruCache<String, LocalValue>,
    created: Instant,
}

/// A fixed-size LRU container with optional container-wide TTL.
pub struct LocalCache {
    code: String,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

impl LocalCache {
    #[must_use]
    pub fn new(code: &str, size: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(size.max(1)).expect("capacity is at least 1");
        Self {
            code: code.to_string(),
            ttl,
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                created: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(ttl) = self.ttl {
            if inner.created.elapsed() >= ttl {
                inner.lru.clear();
                inner.created = Instant::now();
            }
        }
        inner
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<LocalValue> {
        let mut inner = self.lock();
        let hit = inner.lru.get(key).cloned();
        trace!(target: "stratum::cache", cache = %self.code, %key,
            miss = hit.is_none(), "local GET");
        hit
    }

    pub fn set(&self, key: &str, value: LocalValue) {
        let mut inner = self.lock();
        inner.lru.put(key.to_string(), value);
        trace!(target: "stratum::cache", cache = %self.code, %key, "local SET");
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.lock();
        inner.lru.pop(key);
        trace!(target: "stratum::cache", cache = %self.code, %key, "local REMOVE");
    }

    pub fn remove_many(&self, keys: &[String]) {
        let mut inner = self.lock();
        for key in keys {
            inner.lru.pop(key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.created = Instant::now();
        trace!(target: "stratum::cache", cache = %self.code, "local CLEAR");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
