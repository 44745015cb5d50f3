//! In-memory durable queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::driver::{DriverResult, QueueClient};

/// FIFO queues keyed by name; at-least-once in the trivial sense that a
/// popped message is gone unless the receiver re-pushes it.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<BTreeMap<String, VecDeque<Vec<u8>>>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, VecDeque<Vec<u8>>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl QueueClient for MemoryQueue {
    fn push(&self, queue: &str, payload: &[u8]) -> DriverResult<()> {
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    fn pop(&self, queue: &str) -> DriverResult<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }

    fn len(&self, queue: &str) -> DriverResult<u64> {
        Ok(self.lock().get(queue).map_or(0, |q| q.len() as u64))
    }

    fn purge(&self, queue: &str) -> DriverResult<()> {
        self.lock().remove(queue);
        Ok(())
    }
}
