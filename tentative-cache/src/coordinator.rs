//! Reconciliation coordinator.
//!
//! Wraps every mutation lifecycle:
//!
//! ```text
//! on_mutation_start ──→ (remote call) ──┬─ ok ────────────────────────→ on_mutation_settled
//!                                       └─ err ─→ on_mutation_error ──→ on_mutation_settled
//! ```
//!
//! `on_mutation_error` borrows the context and `on_mutation_settled` consumes
//! it, so a rollback always completes before staleness marking begins for the
//! same mutation.
//!
//! Concurrent mutations on one key each snapshot whatever the cache held when
//! they began, possibly another mutation's optimistic value. Rollbacks are
//! independent, so the last one applied wins until the refetch after the final
//! settle replaces it with server truth.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tentative_core::{
    new_mutation_id, CacheKey, MutationError, MutationId, ReconcileConfig, Snapshot, StoreError,
    Timestamp,
};

use crate::controller::OptimisticUpdateController;
use crate::metrics::ReconcileMetrics;
use crate::pending::PendingLog;
use crate::refetch::{RefetchTicket, Refetcher};
use crate::remote::RemoteProcedureClient;
use crate::store::CacheStore;

type BoxedTransform<V> = Box<dyn FnOnce(Option<&V>) -> Result<V, String> + Send>;

struct OptimisticUpdate<V> {
    key: CacheKey,
    transform: BoxedTransform<V>,
}

/// What a mutation will do to the cache: optimistic rewrites applied before
/// dispatch, plus keys that only need invalidating once it settles.
pub struct MutationPlan<V> {
    updates: Vec<OptimisticUpdate<V>>,
    invalidates: Vec<CacheKey>,
}

impl<V> Default for MutationPlan<V> {
    fn default() -> Self {
        Self {
            updates: Vec::new(),
            invalidates: Vec::new(),
        }
    }
}

impl<V: 'static> MutationPlan<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `key` optimistically. Updates apply in the order added.
    pub fn optimistic<F, E>(mut self, key: CacheKey, transform: F) -> Self
    where
        F: FnOnce(Option<&V>) -> Result<V, E> + Send + 'static,
        E: fmt::Display,
    {
        self.updates.push(OptimisticUpdate {
            key,
            transform: Box::new(move |current: Option<&V>| {
                transform(current).map_err(|e| e.to_string())
            }),
        });
        self
    }

    /// Mark `key` stale and refetch it when the mutation settles, without an
    /// optimistic write.
    pub fn invalidates(mut self, key: CacheKey) -> Self {
        self.invalidates.push(key);
        self
    }

    pub fn affected_keys(&self) -> BTreeSet<CacheKey> {
        self.updates
            .iter()
            .map(|update| update.key.clone())
            .chain(self.invalidates.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.invalidates.is_empty()
    }
}

impl<V> fmt::Debug for MutationPlan<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let updates: Vec<&CacheKey> = self.updates.iter().map(|u| &u.key).collect();
        f.debug_struct("MutationPlan")
            .field("updates", &updates)
            .field("invalidates", &self.invalidates)
            .finish()
    }
}

/// Where a mutation context is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    /// Optimistic writes are in the cache, remote call outstanding.
    Applied,
    /// Snapshots have been restored.
    RolledBack,
}

/// How the remote call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Succeeded,
    Failed,
}

/// Per-mutation state: affected keys and the snapshots needed to undo it.
#[derive(Debug)]
pub struct MutationContext<V> {
    id: MutationId,
    affected_keys: BTreeSet<CacheKey>,
    snapshots: Vec<Snapshot<V>>,
    phase: MutationPhase,
    started_at: Timestamp,
}

impl<V> MutationContext<V> {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn affected_keys(&self) -> &BTreeSet<CacheKey> {
        &self.affected_keys
    }

    /// Snapshots in acquisition order. Empty once rolled back.
    pub fn snapshots(&self) -> &[Snapshot<V>] {
        &self.snapshots
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// No optimistic writes were made.
    pub fn is_pass_through(&self) -> bool {
        self.snapshots.is_empty() && self.phase == MutationPhase::Applied
    }
}

pub struct ReconciliationCoordinator<V, R> {
    store: Arc<CacheStore<V>>,
    pending: Arc<PendingLog>,
    controller: OptimisticUpdateController<V>,
    refetcher: Refetcher<V, R>,
    config: ReconcileConfig,
    metrics: Arc<ReconcileMetrics>,
}

impl<V, R> ReconciliationCoordinator<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, remote: Arc<R>, config: ReconcileConfig) -> Self {
        let pending = Arc::new(PendingLog::new());
        let metrics = Arc::new(ReconcileMetrics::new());
        let controller = OptimisticUpdateController::new(Arc::clone(&store), Arc::clone(&metrics));
        let refetcher = Refetcher::new(
            Arc::clone(&store),
            Arc::clone(&pending),
            remote,
            config.clone(),
            Arc::clone(&metrics),
        );
        Self {
            store,
            pending,
            controller,
            refetcher,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn pending(&self) -> &Arc<PendingLog> {
        &self.pending
    }

    pub fn controller(&self) -> &OptimisticUpdateController<V> {
        &self.controller
    }

    pub fn refetcher(&self) -> &Refetcher<V, R> {
        &self.refetcher
    }

    pub fn remote(&self) -> &Arc<R> {
        self.refetcher.remote()
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ReconcileMetrics> {
        &self.metrics
    }

    /// Apply every optimistic update in `plan` and return the context that
    /// can undo them.
    ///
    /// The mutation is entered in the pending log before anything is written,
    /// so a refetch racing with this call cannot land on top of the optimistic
    /// values. If a transform fails, updates already applied are reverted in
    /// reverse order and the cache is left as it was.
    pub fn on_mutation_start(
        &self,
        plan: MutationPlan<V>,
    ) -> Result<MutationContext<V>, MutationError> {
        let id = new_mutation_id();
        let affected_keys = plan.affected_keys();
        self.pending.register(id, affected_keys.iter())?;

        let mut snapshots = Vec::with_capacity(plan.updates.len());
        for update in plan.updates {
            match self
                .controller
                .begin_optimistic(&update.key, update.transform)
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    self.abort(id, &affected_keys, snapshots)?;
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            mutation_id = %id,
            optimistic = snapshots.len(),
            affected = affected_keys.len(),
            "Mutation started"
        );

        Ok(MutationContext {
            id,
            affected_keys,
            snapshots,
            phase: MutationPhase::Applied,
            started_at: Utc::now(),
        })
    }

    fn abort(
        &self,
        id: MutationId,
        affected_keys: &BTreeSet<CacheKey>,
        snapshots: Vec<Snapshot<V>>,
    ) -> Result<(), StoreError> {
        for snapshot in snapshots.into_iter().rev() {
            self.store.revert(snapshot)?;
        }
        self.pending.release(id, affected_keys.iter())?;
        Ok(())
    }

    /// Restore every snapshot, last acquired first. Restored entries are
    /// fresh. Calling it again on the same context does nothing.
    pub fn on_mutation_error(&self, context: &mut MutationContext<V>) -> Result<(), StoreError> {
        if context.phase == MutationPhase::RolledBack {
            return Ok(());
        }

        // Pop one at a time so a retry after a failed restore resumes where
        // this one stopped.
        let mut restored = 0usize;
        while let Some(snapshot) = context.snapshots.pop() {
            self.store.restore(snapshot)?;
            restored += 1;
        }
        context.phase = MutationPhase::RolledBack;

        ReconcileMetrics::add(&self.metrics.rollbacks, restored as u64);
        tracing::debug!(mutation_id = %context.id, restored, "Mutation rolled back");
        Ok(())
    }

    /// Settle a mutation, whatever its outcome: mark every affected key stale
    /// and schedule a refetch for each cached key that no other mutation is
    /// still holding.
    ///
    /// A failed outcome whose context was never rolled back is rolled back
    /// first. If that rollback fails the mutation still leaves the pending
    /// log before the error is returned.
    pub fn on_mutation_settled(
        &self,
        context: MutationContext<V>,
        outcome: MutationOutcome,
    ) -> Result<RefetchTicket, StoreError> {
        let mut context = context;
        let rolled_back = match outcome {
            MutationOutcome::Failed => self.on_mutation_error(&mut context),
            MutationOutcome::Succeeded => Ok(()),
        };

        let MutationContext {
            id, affected_keys, ..
        } = context;

        let drained = self.pending.release(id, affected_keys.iter())?;
        if let Err(e) = rolled_back {
            ReconcileMetrics::incr(&self.metrics.settled_failed);
            tracing::error!(mutation_id = %id, error = %e, "Rollback failed while settling");
            return Err(e);
        }
        let marked = self.store.mark_stale(affected_keys.iter())?;

        match outcome {
            MutationOutcome::Succeeded => ReconcileMetrics::incr(&self.metrics.settled_ok),
            MutationOutcome::Failed => ReconcileMetrics::incr(&self.metrics.settled_failed),
        }

        let ticket = if self.config.refetch_on_settle {
            let mut to_refetch = Vec::with_capacity(drained.len());
            for key in drained {
                if self.store.contains(&key)? {
                    to_refetch.push(key);
                }
            }
            self.refetcher.schedule(to_refetch)
        } else {
            RefetchTicket::default()
        };

        tracing::debug!(
            mutation_id = %id,
            ?outcome,
            marked_stale = marked,
            refetching = ticket.len(),
            "Mutation settled"
        );
        Ok(ticket)
    }
}
