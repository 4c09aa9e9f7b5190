use async_trait::async_trait;
use dflowcore::{Checkpoint, ContextStore, CounterStore, StoreError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

fn lock<'a, T>(m: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, StoreError> {
    m.lock().map_err(|e| StoreError::Poisoned(format!("{:?}", e)))
}

/// Process-local context store. Checkpoints are kept in their dumped form,
/// so every read rebuilds a fresh copy the way a remote store would.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace ids currently stored, sorted.
    pub fn trace_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = lock(&self.entries)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, trace_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let entries = lock(&self.entries)?;
        entries
            .get(trace_id)
            .map(|dumped| {
                Checkpoint::rebuild(dumped).map_err(|e| StoreError::Corrupt {
                    key: trace_id.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    async fn put(&self, trace_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dumped = checkpoint.dump().map_err(|e| StoreError::Corrupt {
            key: trace_id.to_string(),
            reason: e.to_string(),
        })?;
        lock(&self.entries)?.insert(trace_id.to_string(), dumped);
        Ok(())
    }

    async fn remove(&self, trace_id: &str) -> Result<(), StoreError> {
        lock(&self.entries)?.remove(trace_id);
        debug!("Removed checkpoint {}", trace_id);
        Ok(())
    }
}

/// Process-local counter store. Share one instance (behind an `Arc`)
/// between engines to simulate a fleet in tests.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut values = lock(&self.values)?;
        let current = match values.get(key) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("not a counter: {}", raw),
            })?,
        };
        let next = current + delta;
        values.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.values)?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.values)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    async fn reset(&self, key: &str) -> Result<i64, StoreError> {
        let previous = lock(&self.values)?.insert(key.to_string(), "0".to_string());
        Ok(previous.and_then(|raw| raw.parse().ok()).unwrap_or(0))
    }
}
