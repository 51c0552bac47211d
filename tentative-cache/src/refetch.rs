//! Refetching stale entries from the remote source.
//!
//! A refetch never lands on a key with a mutation in flight: the pending log
//! is checked before the round trip and again, under the store's write gate,
//! before the server value is written. The second check also compares the
//! key's pending generation, so a response read before a mutation that has
//! since settled is dropped rather than overwriting that mutation's refetch.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use tentative_core::{
    CacheEntry, CacheKey, EntryStatus, ReconcileConfig, RemoteFailure, StoreError,
};

use crate::metrics::ReconcileMetrics;
use crate::pending::PendingLog;
use crate::remote::RemoteProcedureClient;
use crate::store::CacheStore;

/// What happened to one refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchOutcome {
    /// The server value was written at this version.
    Refreshed { version: u64 },
    /// A mutation was in flight before the round trip; nothing was fetched.
    SkippedInFlight,
    /// A mutation began during the round trip (and may have settled since);
    /// the server value was dropped.
    DiscardedInFlight,
    /// The remote call failed or timed out; the entry stays stale.
    Failed(RemoteFailure),
    /// The refetch task did not run to completion.
    Cancelled,
}

impl RefetchOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }
}

/// Handle on refetches scheduled when a mutation settled.
///
/// Awaiting it waits for every refetch. Dropping it detaches them; they still
/// run to completion.
#[derive(Debug, Default)]
pub struct RefetchTicket {
    tasks: Vec<(CacheKey, JoinHandle<Result<RefetchOutcome, StoreError>>)>,
}

impl RefetchTicket {
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.tasks.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn wait(self) -> Result<Vec<(CacheKey, RefetchOutcome)>, StoreError> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (key, task) in self.tasks {
            let outcome = match task.await {
                Ok(result) => result?,
                Err(_) => RefetchOutcome::Cancelled,
            };
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }
}

pub struct Refetcher<V, R> {
    store: Arc<CacheStore<V>>,
    pending: Arc<PendingLog>,
    remote: Arc<R>,
    config: ReconcileConfig,
    permits: Arc<Semaphore>,
    metrics: Arc<ReconcileMetrics>,
}

impl<V, R> Clone for Refetcher<V, R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pending: Arc::clone(&self.pending),
            remote: Arc::clone(&self.remote),
            config: self.config.clone(),
            permits: Arc::clone(&self.permits),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<V, R> Refetcher<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    pub fn new(
        store: Arc<CacheStore<V>>,
        pending: Arc<PendingLog>,
        remote: Arc<R>,
        config: ReconcileConfig,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_refetches.max(1)));
        Self {
            store,
            pending,
            remote,
            config,
            permits,
            metrics,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Fetch `key` from the server and write it back as fresh.
    pub async fn refetch(&self, key: &CacheKey) -> Result<RefetchOutcome, StoreError> {
        if self.pending.is_pending(key)? {
            ReconcileMetrics::incr(&self.metrics.refetches_skipped);
            tracing::trace!(key = %key, "Refetch skipped, mutation in flight");
            return Ok(RefetchOutcome::SkippedInFlight);
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(RefetchOutcome::Cancelled);
        };
        let generation = self.pending.generation(key)?;

        let fetched = tokio::time::timeout(self.config.refetch_timeout(), self.remote.fetch(key))
            .await
            .unwrap_or_else(|_| Err(RemoteFailure::timeout(key.procedure())));

        let value = match fetched {
            Ok(value) => value,
            Err(failure) => {
                ReconcileMetrics::incr(&self.metrics.refetches_failed);
                tracing::warn!(key = %key, error = %failure, "Refetch failed, entry stays stale");
                return Ok(RefetchOutcome::Failed(failure));
            }
        };

        let pending = &self.pending;
        let written = self.store.update_with(key, |current| {
            if pending.is_pending(key)? || pending.generation(key)? != generation {
                return Ok::<_, StoreError>((None, None));
            }
            let version = current.map_or(0, |entry| entry.version) + 1;
            let entry = CacheEntry::new(key.clone(), Some(value), version, EntryStatus::Fresh);
            Ok((Some(entry), Some(version)))
        })?;

        match written {
            Some(version) => {
                ReconcileMetrics::incr(&self.metrics.refetches_ok);
                tracing::debug!(key = %key, version, "Refetched entry");
                Ok(RefetchOutcome::Refreshed { version })
            }
            None => {
                ReconcileMetrics::incr(&self.metrics.refetches_skipped);
                tracing::debug!(key = %key, "Refetch discarded, mutation ran meanwhile");
                Ok(RefetchOutcome::DiscardedInFlight)
            }
        }
    }

    /// Spawn one refetch task per key on the current runtime.
    ///
    /// Without a runtime nothing is spawned; the keys stay stale until the
    /// next sweep or explicit refetch.
    pub fn schedule<I>(&self, keys: I) -> RefetchTicket
    where
        I: IntoIterator<Item = CacheKey>,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, refetch left to the stale sweep");
            return RefetchTicket::default();
        };

        let tasks = keys
            .into_iter()
            .map(|key| {
                let this = self.clone();
                let task_key = key.clone();
                let task = handle.spawn(async move { this.refetch(&task_key).await });
                (key, task)
            })
            .collect();
        RefetchTicket { tasks }
    }

    /// Refetch every stale entry with no mutation in flight.
    pub async fn refetch_stale(&self) -> Result<Vec<(CacheKey, RefetchOutcome)>, StoreError> {
        let keys = self.store.keys_with_status(EntryStatus::Stale)?;
        let results = join_all(keys.into_iter().map(|key| async move {
            let outcome = self.refetch(&key).await;
            outcome.map(|outcome| (key, outcome))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Background sweep over stale entries until `shutdown` flips to true.
    pub fn spawn_sweep(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(this.config.stale_sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_ms = this.config.stale_sweep_interval_ms,
                "Stale sweep started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Stale sweep shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        this.sweep_once().await;
                    }
                }
            }
        })
    }

    async fn sweep_once(&self) {
        match self.refetch_stale().await {
            Ok(outcomes) if outcomes.is_empty() => {
                tracing::trace!("Stale sweep found nothing to refetch");
            }
            Ok(outcomes) => {
                let refreshed = outcomes.iter().filter(|(_, o)| o.is_refreshed()).count();
                tracing::debug!(
                    stale = outcomes.len(),
                    refreshed,
                    "Stale sweep completed"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Stale sweep failed");
            }
        }
    }
}
