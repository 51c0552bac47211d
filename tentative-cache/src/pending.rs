//! Ordered log of in-flight mutations per key.
//!
//! A key with any mutation in the log is not refetched: a server read landing
//! in the middle of a mutation would overwrite its optimistic value. The last
//! mutation to settle on a key triggers the refetch instead.
//!
//! Each key also carries a generation, bumped whenever a mutation registers on
//! it. A refetch compares the generation from before its round trip with the
//! one at write time, which catches mutations that began and settled while the
//! fetch was on the wire.

use std::collections::HashMap;
use std::sync::Mutex;

use tentative_core::{CacheKey, MutationId, StoreError};

#[derive(Debug, Default)]
struct Inner {
    logs: HashMap<CacheKey, Vec<MutationId>>,
    generations: HashMap<CacheKey, u64>,
}

#[derive(Debug, Default)]
pub struct PendingLog {
    inner: Mutex<Inner>,
}

impl PendingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` to the log of each key, in begin order.
    pub fn register<'a, I>(&self, id: MutationId, keys: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut guard = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        let inner = &mut *guard;
        for key in keys {
            let log = inner.logs.entry(key.clone()).or_default();
            if !log.contains(&id) {
                log.push(id);
                *inner.generations.entry(key.clone()).or_default() += 1;
            }
        }
        Ok(())
    }

    /// Remove `id` from each key's log. Returns the keys left with no
    /// mutation in flight.
    pub fn release<'a, I>(&self, id: MutationId, keys: I) -> Result<Vec<CacheKey>, StoreError>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut drained = Vec::new();
        for key in keys {
            if let Some(log) = inner.logs.get_mut(key) {
                log.retain(|pending| *pending != id);
                if log.is_empty() {
                    inner.logs.remove(key);
                    drained.push(key.clone());
                }
            } else {
                drained.push(key.clone());
            }
        }
        Ok(drained)
    }

    pub fn is_pending(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.logs.contains_key(key))
    }

    /// How many mutations have ever registered on `key`. Never decreases.
    pub fn generation(&self, key: &CacheKey) -> Result<u64, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.generations.get(key).copied().unwrap_or(0))
    }

    /// Mutations in flight on `key`, oldest first.
    pub fn mutations_for(&self, key: &CacheKey) -> Result<Vec<MutationId>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.logs.get(key).cloned().unwrap_or_default())
    }

    pub fn pending_keys(&self) -> Result<Vec<CacheKey>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut keys: Vec<CacheKey> = inner.logs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.logs.is_empty())
    }
}
