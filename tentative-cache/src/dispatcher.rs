//! Mutation dispatcher.
//!
//! Runs the full lifecycle of one mutation: optimistic writes, the remote
//! call, rollback on failure and settle. Everything after the optimistic
//! writes runs in a spawned task, so a caller that stops awaiting does not
//! stop reconciliation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tentative_core::{MutationError, MutationId};

use crate::coordinator::{MutationContext, MutationOutcome, MutationPlan, ReconciliationCoordinator};
use crate::refetch::RefetchTicket;
use crate::remote::RemoteProcedureClient;

type Settled = (Result<Value, MutationError>, RefetchTicket);

pub struct MutationDispatcher<V, R> {
    coordinator: Arc<ReconciliationCoordinator<V, R>>,
}

impl<V, R> Clone for MutationDispatcher<V, R> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<V, R> MutationDispatcher<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    pub fn new(coordinator: Arc<ReconciliationCoordinator<V, R>>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<ReconciliationCoordinator<V, R>> {
        &self.coordinator
    }

    /// Apply `plan`, call `procedure` and reconcile.
    ///
    /// Returns the server's response, or the remote failure after the
    /// optimistic writes have been rolled back. Refetches triggered by the
    /// settle run in the background.
    pub async fn mutate(
        &self,
        plan: MutationPlan<V>,
        procedure: &str,
        args: Value,
    ) -> Result<Value, MutationError> {
        let (result, _ticket) = self.run(plan, procedure, args).await?;
        result
    }

    /// Like [`mutate`](Self::mutate) with typed arguments.
    pub async fn mutate_with<A>(
        &self,
        plan: MutationPlan<V>,
        procedure: &str,
        args: &A,
    ) -> Result<Value, MutationError>
    where
        A: Serialize + ?Sized,
    {
        let args = serde_json::to_value(args).map_err(|e| MutationError::InvalidArgs {
            procedure: procedure.to_string(),
            reason: e.to_string(),
        })?;
        self.mutate(plan, procedure, args).await
    }

    /// Like [`mutate`](Self::mutate), but also waits for the refetches the
    /// settle scheduled, so the cache holds server truth on return.
    pub async fn mutate_and_wait(
        &self,
        plan: MutationPlan<V>,
        procedure: &str,
        args: Value,
    ) -> Result<Value, MutationError> {
        let (result, ticket) = self.run(plan, procedure, args).await?;
        ticket.wait().await?;
        result
    }

    async fn run(
        &self,
        plan: MutationPlan<V>,
        procedure: &str,
        args: Value,
    ) -> Result<Settled, MutationError> {
        let context = self.coordinator.on_mutation_start(plan)?;
        let mutation_id = context.id();
        let in_flight = InFlight {
            coordinator: Arc::clone(&self.coordinator),
            mutation_id,
            context: Some(context),
        };
        let procedure = procedure.to_string();

        let task = tokio::spawn(drive(in_flight, procedure, args));
        task.await
            .unwrap_or_else(|_| Err(MutationError::Aborted { mutation_id }))
    }
}

async fn drive<V, R>(
    mut in_flight: InFlight<V, R>,
    procedure: String,
    args: Value,
) -> Result<Settled, MutationError>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    let response = in_flight
        .coordinator
        .remote()
        .invoke(&procedure, &args)
        .await;

    let coordinator = Arc::clone(&in_flight.coordinator);
    let mutation_id = in_flight.mutation_id;

    // The context stays in the guard until settle takes it, so an error or
    // panic during rollback still settles the mutation on drop.
    let (outcome, result) = match response {
        Ok(payload) => (MutationOutcome::Succeeded, Ok(payload)),
        Err(failure) => {
            tracing::warn!(
                mutation_id = %mutation_id,
                procedure = %procedure,
                error = %failure,
                "Mutation failed, rolling back"
            );
            if let Some(context) = in_flight.context.as_mut() {
                coordinator.on_mutation_error(context)?;
            }
            (MutationOutcome::Failed, Err(MutationError::Remote(failure)))
        }
    };

    let Some(context) = in_flight.context.take() else {
        return Err(MutationError::Aborted { mutation_id });
    };
    let ticket = coordinator.on_mutation_settled(context, outcome)?;
    Ok((result, ticket))
}

/// Owns a started mutation until it settles. Dropped unsettled (the task was
/// cancelled, the remote client panicked or rollback returned an error), it
/// rolls back what it can and settles.
struct InFlight<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    coordinator: Arc<ReconciliationCoordinator<V, R>>,
    mutation_id: MutationId,
    context: Option<MutationContext<V>>,
}

impl<V, R> Drop for InFlight<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: RemoteProcedureClient<V> + 'static,
{
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        let mutation_id = self.mutation_id;
        tracing::warn!(mutation_id = %mutation_id, "Mutation abandoned before settling, rolling back");
        if let Err(e) = self
            .coordinator
            .on_mutation_settled(context, MutationOutcome::Failed)
        {
            tracing::error!(mutation_id = %mutation_id, error = %e, "Failed to settle abandoned mutation");
        }
    }
}
