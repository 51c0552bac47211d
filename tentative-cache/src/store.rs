//! Versioned key/value store of cached query results.
//!
//! Every mutating call goes through a single write gate: value, version and
//! status of an entry are replaced under one lock, and subscribers of that key
//! are notified before the gate is released. Subscribers therefore observe
//! writes in exactly the order they were issued.
//!
//! Subscriber callbacks run on the writer's stack. They may read the store,
//! but must not write to it. A callback that panics is logged and skipped;
//! the write it was notified of stands.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tentative_core::{CacheEntry, CacheKey, EntryStatus, KeyFilter, Snapshot, StoreError};

/// Callback invoked with the new state of an entry after each change.
pub type SubscriberFn<V> = Arc<dyn Fn(&CacheEntry<V>) + Send + Sync>;

type SubscriptionId = u64;

struct Registry<V> {
    next_id: SubscriptionId,
    by_key: HashMap<CacheKey, Vec<(SubscriptionId, SubscriberFn<V>)>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            next_id: 0,
            by_key: HashMap::new(),
        }
    }
}

/// Type-erased handle back into a registry, so `Subscription` is not generic.
trait Detach: Send + Sync {
    fn detach(&self, key: &CacheKey, id: SubscriptionId);
}

impl<V: Send + Sync> Detach for RwLock<Registry<V>> {
    fn detach(&self, key: &CacheKey, id: SubscriptionId) {
        // A poisoned registry has nothing left worth detaching from.
        if let Ok(mut registry) = self.write() {
            if let Some(subs) = registry.by_key.get_mut(key) {
                subs.retain(|(sub_id, _)| *sub_id != id);
                if subs.is_empty() {
                    registry.by_key.remove(key);
                }
            }
        }
    }
}

/// Scoped subscription to one key. Dropping it unsubscribes.
pub struct Subscription {
    key: CacheKey,
    id: SubscriptionId,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Release explicitly. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.key, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Process-wide cache of query results for one client session.
///
/// Created once per session and passed explicitly to every component that
/// needs it. Call [`CacheStore::teardown`] when the session ends.
pub struct CacheStore<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
    subscribers: Arc<RwLock<Registry<V>>>,
    write_gate: Mutex<()>,
}

impl<V> Default for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(Registry::default())),
            write_gate: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Pure lookup. Returns a copy of the entry, if any.
    pub fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    /// Shorthand for the cached value alone.
    pub fn value(&self, key: &CacheKey) -> Result<Option<V>, StoreError> {
        Ok(self.read(key)?.and_then(|entry| entry.value))
    }

    pub fn keys_with_status(&self, status: EntryStatus) -> Result<Vec<CacheKey>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut keys: Vec<CacheKey> = entries
            .values()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.contains_key(key))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Authoritative write: replace value and version, status becomes fresh.
    pub fn write(&self, key: CacheKey, value: V, version: u64) -> Result<(), StoreError> {
        self.write_with_status(key, value, version, EntryStatus::Fresh)
    }

    pub fn write_with_status(
        &self,
        key: CacheKey,
        value: V,
        version: u64,
        status: EntryStatus,
    ) -> Result<(), StoreError> {
        let _gate = self.gate()?;
        self.commit(CacheEntry::new(key, Some(value), version, status))
    }

    /// Write a server-confirmed value one version past whatever is cached.
    /// Returns the version written.
    pub fn write_authoritative(&self, key: CacheKey, value: V) -> Result<u64, StoreError> {
        self.update_with(&key, |current| {
            let version = current.map_or(0, |entry| entry.version) + 1;
            let entry = CacheEntry::new(key.clone(), Some(value), version, EntryStatus::Fresh);
            Ok::<_, StoreError>((Some(entry), version))
        })
    }

    /// Read, compute and write one key without any other writer interleaving.
    ///
    /// `f` sees the current entry and returns the replacement (or `None` to
    /// leave the key alone) together with a result for the caller. If `f`
    /// fails, nothing is written.
    pub fn update_with<T, E, F>(&self, key: &CacheKey, f: F) -> Result<T, E>
    where
        F: FnOnce(Option<&CacheEntry<V>>) -> Result<(Option<CacheEntry<V>>, T), E>,
        E: From<StoreError>,
    {
        let _gate = self.gate()?;
        let current = self.read(key)?;
        let (next, output) = f(current.as_ref())?;
        if let Some(next) = next {
            self.commit(next)?;
        }
        Ok(output)
    }

    /// Roll back to a snapshot: value and version exactly as captured, status
    /// fresh. A snapshot of an absent key removes the entry.
    pub fn restore(&self, snapshot: Snapshot<V>) -> Result<(), StoreError> {
        self.put_back(snapshot, EntryStatus::Fresh)
    }

    /// Like [`restore`](Self::restore), but also brings back the captured
    /// status. Used when an optimistic write is aborted before dispatch.
    pub fn revert(&self, snapshot: Snapshot<V>) -> Result<(), StoreError> {
        let status = snapshot.status();
        self.put_back(snapshot, status)
    }

    fn put_back(&self, snapshot: Snapshot<V>, status: EntryStatus) -> Result<(), StoreError> {
        let _gate = self.gate()?;
        let (key, value, version, _) = snapshot.into_parts();
        match value {
            Some(value) => self.commit(CacheEntry::new(key, Some(value), version, status)),
            None => {
                {
                    let mut entries =
                        self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
                    entries.remove(&key);
                }
                self.notify(&CacheEntry::tombstone(key))
            }
        }
    }

    /// Flip entries to stale without touching value or version. Keys with no
    /// entry and entries already stale are left alone, so repeating the call
    /// changes nothing. Returns how many entries changed.
    pub fn mark_stale<'a, I>(&self, keys: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let _gate = self.gate()?;
        let changed = {
            let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
            let mut changed = Vec::new();
            for key in keys {
                if let Some(entry) = entries.get_mut(key) {
                    if !entry.status.is_stale() {
                        entry.status = EntryStatus::Stale;
                        changed.push(entry.clone());
                    }
                }
            }
            changed
        };
        for entry in &changed {
            self.notify(entry)?;
        }
        Ok(changed.len())
    }

    /// Mark every entry selected by `filter` stale.
    pub fn mark_stale_matching(&self, filter: &KeyFilter) -> Result<usize, StoreError> {
        let keys: Vec<CacheKey> = {
            let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
            entries.keys().filter(|k| filter.matches(k)).cloned().collect()
        };
        self.mark_stale(keys.iter())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Result<Subscription, StoreError>
    where
        F: Fn(&CacheEntry<V>) + Send + Sync + 'static,
    {
        let mut registry = self
            .subscribers
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_key
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let erased: Arc<dyn Detach> = self.subscribers.clone();
        Ok(Subscription {
            key,
            id,
            registry: Arc::downgrade(&erased),
        })
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let registry = self
            .subscribers
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(registry.by_key.get(key).map_or(0, Vec::len))
    }

    /// End of session: drop every entry and every subscription.
    pub fn teardown(&self) -> Result<(), StoreError> {
        let _gate = self.gate()?;
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .clear();
        self.subscribers
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .by_key
            .clear();
        tracing::debug!("Cache store torn down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals (caller holds the write gate)
    // ------------------------------------------------------------------

    fn gate(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_gate.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn commit(&self, entry: CacheEntry<V>) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
            entries.insert(entry.key.clone(), entry.clone());
        }
        self.notify(&entry)
    }

    fn notify(&self, entry: &CacheEntry<V>) -> Result<(), StoreError> {
        let callbacks: Vec<SubscriberFn<V>> = {
            let registry = self
                .subscribers
                .read()
                .map_err(|_| StoreError::LockPoisoned)?;
            registry
                .by_key
                .get(&entry.key)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            // A panicking subscriber must not unwind through the write gate.
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(entry)));
            if result.is_err() {
                tracing::error!(key = %entry.key, "Subscriber panicked, notification dropped");
            }
        }
        Ok(())
    }
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("CacheStore")
            .field("entries", &entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn key(name: &str) -> CacheKey {
        CacheKey::procedure_only(name).unwrap()
    }

    fn recorder(
        store: &CacheStore<u32>,
        key: CacheKey,
    ) -> (Subscription, Arc<StdMutex<Vec<CacheEntry<u32>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = store
            .subscribe(key, move |entry| sink.lock().unwrap().push(entry.clone()))
            .unwrap();
        (sub, seen)
    }

    #[test]
    fn test_read_missing_is_none() {
        let store: CacheStore<u32> = CacheStore::new();
        assert!(store.read(&key("a")).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_write_then_read() {
        let store = CacheStore::new();
        store.write(key("a"), 7u32, 3).unwrap();

        let entry = store.read(&key("a")).unwrap().unwrap();
        assert_eq!(entry.value, Some(7));
        assert_eq!(entry.version, 3);
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(store.value(&key("a")).unwrap(), Some(7));
    }

    #[test]
    fn test_subscriber_notified_synchronously() {
        let store = CacheStore::new();
        let (_sub, seen) = recorder(&store, key("a"));

        store.write(key("a"), 1u32, 1).unwrap();
        // Visible before write() returned control to anything else.
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].value, Some(1));
    }

    #[test]
    fn test_subscriber_only_sees_its_key() {
        let store = CacheStore::new();
        let (_sub, seen) = recorder(&store, key("a"));
        store.write(key("b"), 1u32, 1).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let store = CacheStore::new();
        let (sub, seen) = recorder(&store, key("a"));
        assert_eq!(store.subscriber_count(&key("a")).unwrap(), 1);

        sub.unsubscribe();
        assert_eq!(store.subscriber_count(&key("a")).unwrap(), 0);

        store.write(key("a"), 1u32, 1).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscriber_may_read_store() {
        let store = Arc::new(CacheStore::new());
        let observed = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&observed);
        let reader = Arc::clone(&store);
        let _sub = store
            .subscribe(key("a"), move |_| {
                *sink.lock().unwrap() = reader.value(&key("a")).unwrap();
            })
            .unwrap();

        store.write(key("a"), 9u32, 1).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(9));
    }

    #[test]
    fn test_mark_stale_is_idempotent() {
        let store = CacheStore::new();
        store.write(key("a"), 1u32, 1).unwrap();
        let (_sub, seen) = recorder(&store, key("a"));

        assert_eq!(store.mark_stale([key("a"), key("missing")].iter()).unwrap(), 1);
        assert_eq!(store.mark_stale([key("a")].iter()).unwrap(), 0);

        let entry = store.read(&key("a")).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Stale);
        assert_eq!(entry.value, Some(1));
        assert_eq!(entry.version, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_stale_matching_procedure() {
        let store = CacheStore::new();
        let a = CacheKey::new("todo.byId", &serde_json::json!({"id": "a"})).unwrap();
        let b = CacheKey::new("todo.byId", &serde_json::json!({"id": "b"})).unwrap();
        store.write(a.clone(), 1u32, 1).unwrap();
        store.write(b.clone(), 2u32, 1).unwrap();
        store.write(key("todo.list"), 3u32, 1).unwrap();

        let changed = store
            .mark_stale_matching(&KeyFilter::Procedure("todo.byId".to_string()))
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(store.keys_with_status(EntryStatus::Stale).unwrap(), vec![a, b]);
        assert_eq!(
            store.keys_with_status(EntryStatus::Fresh).unwrap(),
            vec![key("todo.list")]
        );
    }

    #[test]
    fn test_restore_absent_snapshot_removes_entry() {
        let store = CacheStore::new();
        let (_sub, seen) = recorder(&store, key("a"));
        store
            .write_with_status(key("a"), 5u32, 1, EntryStatus::Pending)
            .unwrap();

        store.restore(Snapshot::absent(key("a"))).unwrap();

        assert!(store.read(&key("a")).unwrap().is_none());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_tombstone());
    }

    #[test]
    fn test_restore_sets_fresh_and_revert_keeps_status() {
        let store = CacheStore::new();
        store
            .write_with_status(key("a"), 1u32, 4, EntryStatus::Stale)
            .unwrap();
        let before = store.read(&key("a")).unwrap();

        store
            .write_with_status(key("a"), 2u32, 5, EntryStatus::Pending)
            .unwrap();
        store
            .restore(Snapshot::capture(key("a"), before.as_ref()))
            .unwrap();
        let restored = store.read(&key("a")).unwrap().unwrap();
        assert_eq!((restored.value, restored.version), (Some(1), 4));
        assert_eq!(restored.status, EntryStatus::Fresh);

        store
            .write_with_status(key("a"), 2u32, 5, EntryStatus::Pending)
            .unwrap();
        store
            .revert(Snapshot::capture(key("a"), before.as_ref()))
            .unwrap();
        let reverted = store.read(&key("a")).unwrap().unwrap();
        assert_eq!(reverted.status, EntryStatus::Stale);
    }

    #[test]
    fn test_update_with_failure_writes_nothing() {
        let store = CacheStore::new();
        store.write(key("a"), 1u32, 1).unwrap();
        let (_sub, seen) = recorder(&store, key("a"));

        let result: Result<(), StoreError> =
            store.update_with(&key("a"), |_| Err(StoreError::LockPoisoned));
        assert!(result.is_err());
        assert_eq!(store.read(&key("a")).unwrap().unwrap().version, 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_authoritative_bumps_version() {
        let store = CacheStore::new();
        assert_eq!(store.write_authoritative(key("a"), 1u32).unwrap(), 1);
        store.mark_stale([key("a")].iter()).unwrap();
        assert_eq!(store.write_authoritative(key("a"), 2u32).unwrap(), 2);

        let entry = store.read(&key("a")).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(entry.value, Some(2));
    }

    #[test]
    fn test_teardown_clears_everything() {
        let store = CacheStore::new();
        store.write(key("a"), 1u32, 1).unwrap();
        let (sub, seen) = recorder(&store, key("a"));

        store.teardown().unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.subscriber_count(&key("a")).unwrap(), 0);

        store.write(key("a"), 2u32, 1).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        drop(sub);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_writes() {
        let store = CacheStore::new();
        let _bad = store
            .subscribe(key("a"), |_: &CacheEntry<u32>| panic!("subscriber bug"))
            .unwrap();
        let (_sub, seen) = recorder(&store, key("a"));

        store.write(key("a"), 1u32, 1).unwrap();
        store.write(key("a"), 2u32, 2).unwrap();

        assert_eq!(store.value(&key("a")).unwrap(), Some(2));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
