//! In-memory KV store with string, set and list values and lazy TTL expiry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::driver::{DriverError, DriverResult, KvClient};

#[derive(Debug, Clone)]
enum KvValue {
    Str(String),
    Set(BTreeSet<String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: KvValue,
    expires_at: Option<Instant>,
}

/// In-memory stand-in for the remote KV store.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a key, for assertions on sentinel expiry.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let map = self.lock();
        map.get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let mut map = self.lock();
        let now = Instant::now();
        map.retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        map.len()
    }

    pub fn flush_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live<'a>(
        map: &'a mut BTreeMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        let expired = map
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            map.remove(key);
            return None;
        }
        map.get_mut(key)
    }
}

impl KvClient for MemoryKv {
    fn get(&self, key: &str) -> DriverResult<Option<String>> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            Some(Entry {
                value: KvValue::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(DriverError::Other(format!("wrong value kind at '{key}'"))),
            None => Ok(None),
        }
    }

    fn mget(&self, keys: &[String]) -> DriverResult<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> DriverResult<()> {
        let mut map = self.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: KvValue::Str(value.to_string()),
                expires_at: ttl_seconds.map(|ttl| Instant::now() + Duration::from_secs(ttl)),
            },
        );
        Ok(())
    }

    fn mset(&self, pairs: &[(String, String)]) -> DriverResult<()> {
        let mut map = self.lock();
        for (key, value) in pairs {
            map.insert(
                key.clone(),
                Entry {
                    value: KvValue::Str(value.clone()),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    fn del(&self, keys: &[String]) -> DriverResult<()> {
        let mut map = self.lock();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl_seconds: u64) -> DriverResult<bool> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: KvValue::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(true)
    }

    fn sadd(&self, key: &str, members: &[String]) -> DriverResult<u64> {
        let mut map = self.lock();
        let entry = match Self::live(&mut map, key) {
            Some(entry) => entry,
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: KvValue::Set(BTreeSet::new()),
                        expires_at: None,
                    },
                );
                map.get_mut(key).ok_or_else(|| {
                    DriverError::Other("entry vanished".to_string())
                })?
            }
        };
        let KvValue::Set(set) = &mut entry.value else {
            return Err(DriverError::Other(format!("wrong value kind at '{key}'")));
        };
        let mut added = 0;
        for member in members {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    fn spop(&self, key: &str, count: u64) -> DriverResult<Vec<String>> {
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key) else {
            return Ok(Vec::new());
        };
        let KvValue::Set(set) = &mut entry.value else {
            return Err(DriverError::Other(format!("wrong value kind at '{key}'")));
        };
        // Deterministic pop order keeps tests reproducible.
        let popped: Vec<String> = set
            .iter()
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        for member in &popped {
            set.remove(member);
        }
        if set.is_empty() {
            map.remove(key);
        }
        Ok(popped)
    }

    fn scard(&self, key: &str) -> DriverResult<u64> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            Some(Entry {
                value: KvValue::Set(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(DriverError::Other(format!("wrong value kind at '{key}'"))),
            None => Ok(0),
        }
    }

    fn rpush(&self, key: &str, values: &[String]) -> DriverResult<u64> {
        let mut map = self.lock();
        let entry = match Self::live(&mut map, key) {
            Some(entry) => entry,
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: KvValue::List(Vec::new()),
                        expires_at: None,
                    },
                );
                map.get_mut(key).ok_or_else(|| {
                    DriverError::Other("entry vanished".to_string())
                })?
            }
        };
        let KvValue::List(list) = &mut entry.value else {
            return Err(DriverError::Other(format!("wrong value kind at '{key}'")));
        };
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key) else {
            return Ok(Vec::new());
        };
        let KvValue::List(list) = &entry.value else {
            return Err(DriverError::Other(format!("wrong value kind at '{key}'")));
        };
        let len = list.len() as i64;
        let resolve = |index: i64| -> i64 {
            if index < 0 { len + index } else { index }
        };
        let from = resolve(start).max(0);
        let to = resolve(stop).min(len - 1);
        if from > to || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list[from as usize..=to as usize].to_vec())
    }

    fn llen(&self, key: &str) -> DriverResult<u64> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            Some(Entry {
                value: KvValue::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(DriverError::Other(format!("wrong value kind at '{key}'"))),
            None => Ok(0),
        }
    }
}
