//! Tentative Cache - Optimistic Updates and Reconciliation
//!
//! Client-side query cache that applies mutations speculatively, rolls them
//! back when the server rejects them, and refetches affected queries once
//! they settle so the cache converges on server truth.
//!
//! The remote transport is abstracted behind [`RemoteProcedureClient`].

pub mod controller;
pub mod coordinator;
pub mod dispatcher;
pub mod metrics;
pub mod pending;
pub mod refetch;
pub mod remote;
pub mod session;
pub mod store;

pub use controller::OptimisticUpdateController;
pub use coordinator::{
    MutationContext, MutationOutcome, MutationPhase, MutationPlan, ReconciliationCoordinator,
};
pub use dispatcher::MutationDispatcher;
pub use metrics::{ReconcileMetrics, ReconcileMetricsSnapshot};
pub use pending::PendingLog;
pub use refetch::{RefetchOutcome, RefetchTicket, Refetcher};
pub use remote::RemoteProcedureClient;
pub use session::CacheSession;
pub use store::{CacheStore, SubscriberFn, Subscription};

// Re-export core types so most callers need a single dependency.
pub use tentative_core::{
    CacheEntry, CacheKey, EntryStatus, KeyFilter, MutationError, MutationId, ReconcileConfig,
    RemoteFailure, RemoteFailureKind, Snapshot, StoreError,
};
