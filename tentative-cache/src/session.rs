//! Per-session wiring: one store, one coordinator, one dispatcher, and the
//! optional stale sweep. Created when a client session starts and shut down
//! when it ends.

use std::sync::Arc;

use tentative_core::{ConfigError, ReconcileConfig, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::ReconciliationCoordinator;
use crate::dispatcher::MutationDispatcher;
use crate::remote::RemoteProcedureClient;
use crate::store::CacheStore;

pub struct CacheSession<V, R> {
    store: Arc<CacheStore<V>>,
    dispatcher: MutationDispatcher<V, R>,
    sweep: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl<V, R> CacheSession<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    pub fn new(remote: Arc<R>, config: ReconcileConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(CacheStore::new());
        let coordinator = ReconciliationCoordinator::new(Arc::clone(&store), remote, config);
        Ok(Self {
            store,
            dispatcher: MutationDispatcher::new(Arc::new(coordinator)),
            sweep: None,
        })
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ReconciliationCoordinator<V, R>> {
        self.dispatcher.coordinator()
    }

    pub fn dispatcher(&self) -> &MutationDispatcher<V, R> {
        &self.dispatcher
    }

    /// Start the background stale sweep. Must be called inside a runtime.
    /// Does nothing if the sweep is already running.
    pub fn start_sweep(&mut self) {
        if self.sweep.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let handle = self.coordinator().refetcher().spawn_sweep(rx);
        self.sweep = Some((tx, handle));
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.is_some()
    }

    /// Stop the sweep, then drop every entry and subscriber.
    pub async fn shutdown(mut self) -> Result<(), StoreError> {
        if let Some((tx, handle)) = self.sweep.take() {
            let _ = tx.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Stale sweep task ended abnormally");
            }
        }
        self.store.teardown()?;
        tracing::info!("Cache session shut down");
        Ok(())
    }
}
