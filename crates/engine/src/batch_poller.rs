//! The batch poller — advances runs whose iteration rides a submitted
//! batch. The claimant instance polls its own batches; unclaimed batch
//! runs (reaped claims) are adopted by whichever poller sees them first,
//! with the run-state guard resolving races.

use std::sync::Arc;
use std::time::Duration;

use am_domain::config::EngineConfig;
use am_domain::iteration::{BatchStatus, Iteration};
use am_domain::run::{Run, RunError, RunErrorType, RunState};
use am_domain::Result;
use am_model::{BatchItemResult, ModelClient};
use am_store::{IterationOutcome, RunStateUpdate, Store};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::run_worker::ingest_model_response;

pub struct BatchPoller {
    store: Arc<dyn Store>,
    model: Arc<dyn ModelClient>,
    config: EngineConfig,
    instance_id: Uuid,
}

impl BatchPoller {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn ModelClient>, config: EngineConfig, instance_id: Uuid) -> Self {
        Self {
            store,
            model,
            config,
            instance_id,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.workers.batch_poll_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = poll.tick() => {}
            }
            if let Err(e) = self.poll_round().await {
                tracing::warn!(error = %e, "batch poll round failed");
            }
        }
    }

    async fn poll_round(&self) -> Result<()> {
        for iteration in self.store.list_open_batch_iterations().await? {
            let run = self.store.get_run(iteration.run_id).await?;
            if run.is_terminal() {
                // Left over from a run that failed elsewhere.
                let _ = self
                    .store
                    .complete_iteration(
                        iteration.id,
                        IterationOutcome {
                            stop_reason: Some("abandoned".into()),
                            ..Default::default()
                        },
                    )
                    .await;
                continue;
            }
            // Another live instance owns this batch.
            if run
                .claimed_by_instance_id
                .map(|id| id != self.instance_id)
                .unwrap_or(false)
            {
                continue;
            }
            if let Err(e) = self.poll_iteration(&run, &iteration).await {
                if e.is_state_transition_failed() {
                    tracing::debug!(run_id = %run.id, "batch result raced with another worker");
                } else {
                    tracing::warn!(error = %e, run_id = %run.id, "batch iteration poll failed");
                }
            }
        }
        Ok(())
    }

    async fn poll_iteration(&self, run: &Run, iteration: &Iteration) -> Result<()> {
        let batch_id = iteration.batch_id.clone().unwrap_or_default();
        let handle = match self.model.get_batch(&batch_id).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, %batch_id, "batch status fetch failed");
                return Ok(());
            }
        };

        self.store
            .update_iteration_batch(iteration.id, &batch_id, handle.status, true)
            .await?;

        match handle.status {
            BatchStatus::InProgress | BatchStatus::Canceling => {
                if run.state == RunState::BatchPending {
                    // First in-progress observation.
                    match self
                        .store
                        .update_run_state(
                            run.id,
                            RunState::BatchProcessing,
                            RunStateUpdate::default(),
                            Some(RunState::BatchPending),
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(e) if e.is_state_transition_failed() => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            BatchStatus::Errored => {
                self.fail_run(run, iteration, "batch ended in error").await
            }
            BatchStatus::Ended => self.ingest_results(run, iteration, &batch_id).await,
        }
    }

    async fn ingest_results(&self, run: &Run, iteration: &Iteration, batch_id: &str) -> Result<()> {
        let mut results = self.model.batch_results(batch_id).await?;
        let wanted = iteration.id.to_string();
        let mut found = None;
        while let Some(item) = results.next().await {
            let item = item?;
            if item.custom_id == wanted {
                found = Some(item.result);
                break;
            }
        }

        // The run may have moved since the listing; the required-state
        // guard below re-checks under lock.
        let current = self.store.get_run(run.id).await?;
        match found {
            Some(BatchItemResult::Succeeded { response }) => {
                ingest_model_response(
                    self.store.as_ref(),
                    &self.config,
                    &current,
                    iteration.id,
                    response,
                    current.state,
                )
                .await
            }
            Some(BatchItemResult::Errored { message }) => {
                self.fail_run(&current, iteration, &message).await
            }
            Some(BatchItemResult::Cancelled) => self.fail_run(&current, iteration, "batch request cancelled").await,
            Some(BatchItemResult::Expired) => self.fail_run(&current, iteration, "batch request expired").await,
            None => {
                self.fail_run(&current, iteration, "batch ended without a result for this iteration")
                    .await
            }
        }
    }

    async fn fail_run(&self, run: &Run, iteration: &Iteration, message: &str) -> Result<()> {
        let _ = self
            .store
            .complete_iteration(
                iteration.id,
                IterationOutcome {
                    stop_reason: Some("error".into()),
                    ..Default::default()
                },
            )
            .await;
        match self
            .store
            .update_run_state(
                run.id,
                RunState::Failed,
                RunStateUpdate::with_error(RunError::new(RunErrorType::BatchError, message)),
                None,
            )
            .await
        {
            Ok(_) => {
                tracing::warn!(run_id = %run.id, message, "batch run failed");
                Ok(())
            }
            Err(e) if e.is_state_transition_failed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
