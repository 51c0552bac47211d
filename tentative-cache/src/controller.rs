//! Optimistic update controller.
//!
//! Applies a speculative transform to one cache entry and hands back the
//! snapshot needed to undo it. Read, transform and write happen under the
//! store's write gate, so no other write to the key can slip in between.

use std::fmt;
use std::sync::Arc;

use tentative_core::{CacheEntry, CacheKey, EntryStatus, MutationError, Snapshot};

use crate::metrics::ReconcileMetrics;
use crate::store::CacheStore;

pub struct OptimisticUpdateController<V> {
    store: Arc<CacheStore<V>>,
    metrics: Arc<ReconcileMetrics>,
}

impl<V> OptimisticUpdateController<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, metrics: Arc<ReconcileMetrics>) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    /// Snapshot `key`, write `transform(current)` at `version + 1` with status
    /// pending, and return the snapshot.
    ///
    /// `transform` receives `None` when nothing is cached for the key; no
    /// placeholder value is made up. It must be a pure function of the value
    /// it is given. If it fails, nothing is written and the error comes back
    /// as [`MutationError::Transform`].
    pub fn begin_optimistic<F, E>(
        &self,
        key: &CacheKey,
        transform: F,
    ) -> Result<Snapshot<V>, MutationError>
    where
        F: FnOnce(Option<&V>) -> Result<V, E>,
        E: fmt::Display,
    {
        let result = self.store.update_with(key, |current| {
            let snapshot = Snapshot::capture(key.clone(), current);
            let next = transform(current.and_then(CacheEntry::value)).map_err(|e| {
                MutationError::Transform {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let entry = CacheEntry::new(
                key.clone(),
                Some(next),
                snapshot.version() + 1,
                EntryStatus::Pending,
            );
            Ok((Some(entry), snapshot))
        });

        match &result {
            Ok(snapshot) => {
                ReconcileMetrics::incr(&self.metrics.optimistic_writes);
                tracing::debug!(
                    key = %key,
                    from_version = snapshot.version(),
                    was_absent = snapshot.was_absent(),
                    "Optimistic write applied"
                );
            }
            Err(MutationError::Transform { reason, .. }) => {
                ReconcileMetrics::incr(&self.metrics.transform_failures);
                tracing::debug!(key = %key, reason = %reason, "Optimistic transform failed");
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn setup() -> (Arc<CacheStore<i64>>, OptimisticUpdateController<i64>) {
        let store = Arc::new(CacheStore::new());
        let controller =
            OptimisticUpdateController::new(Arc::clone(&store), Arc::new(ReconcileMetrics::new()));
        (store, controller)
    }

    fn key() -> CacheKey {
        CacheKey::procedure_only("counter.get").unwrap()
    }

    #[test]
    fn test_begin_optimistic_writes_pending_next_version() {
        let (store, controller) = setup();
        store.write(key(), 10, 3).unwrap();

        let snapshot = controller
            .begin_optimistic(&key(), |v| Ok::<_, String>(v.copied().unwrap_or(0) + 1))
            .unwrap();

        assert_eq!(snapshot.value(), Some(&10));
        assert_eq!(snapshot.version(), 3);

        let entry = store.read(&key()).unwrap().unwrap();
        assert_eq!(entry.value, Some(11));
        assert_eq!(entry.version, 4);
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[test]
    fn test_absent_key_passes_none() {
        let (store, controller) = setup();
        let seen = Mutex::new(None);

        let snapshot = controller
            .begin_optimistic(&key(), |v| {
                *seen.lock().unwrap() = Some(v.is_none());
                Ok::<_, String>(1)
            })
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert!(snapshot.was_absent());
        assert_eq!(store.read(&key()).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_transform_error_leaves_entry_untouched() {
        let (store, controller) = setup();
        store.write(key(), 10, 3).unwrap();
        let before = store.read(&key()).unwrap().unwrap();

        let err = controller
            .begin_optimistic(&key(), |_| Err::<i64, _>("boom"))
            .unwrap_err();

        assert!(matches!(err, MutationError::Transform { ref reason, .. } if reason == "boom"));
        assert_eq!(store.read(&key()).unwrap().unwrap(), before);
        assert_eq!(controller.metrics.snapshot().transform_failures, 1);
        assert_eq!(controller.metrics.snapshot().optimistic_writes, 0);
    }

    #[test]
    fn test_stacked_optimistic_writes_snapshot_latest() {
        let (store, controller) = setup();
        store.write(key(), 0, 1).unwrap();

        let first = controller
            .begin_optimistic(&key(), |v| Ok::<_, String>(v.copied().unwrap_or(0) + 1))
            .unwrap();
        let second = controller
            .begin_optimistic(&key(), |v| Ok::<_, String>(v.copied().unwrap_or(0) + 1))
            .unwrap();

        assert_eq!((first.value(), first.version()), (Some(&0), 1));
        assert_eq!((second.value(), second.version()), (Some(&1), 2));
        assert_eq!(store.read(&key()).unwrap().unwrap().version, 3);
    }
}
