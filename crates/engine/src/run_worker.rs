//! The run worker — claims pending runs of one mode, builds model input,
//! and drives iterations (streaming inline, batch via submission).

use std::sync::Arc;
use std::time::Duration;

use am_compaction::Compactor;
use am_domain::config::EngineConfig;
use am_domain::iteration::{Iteration, TriggerType};
use am_domain::message::{Message, Role};
use am_domain::run::{Run, RunError, RunErrorType, RunMode, RunState};
use am_domain::tool_execution::ToolExecution;
use am_domain::{Error, Result};
use am_model::{accumulate, BatchRequestItem, ModelClient, ModelResponse};
use am_store::{IterationOutcome, RecordIterationResult, RunStateUpdate, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::build_model_request;
use crate::registry::Registry;

pub struct RunWorker {
    store: Arc<dyn Store>,
    model: Arc<dyn ModelClient>,
    registry: Arc<Registry>,
    compactor: Arc<Compactor>,
    config: EngineConfig,
    instance_id: Uuid,
    run_mode: RunMode,
    trigger: mpsc::Receiver<()>,
}

impl RunWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        model: Arc<dyn ModelClient>,
        registry: Arc<Registry>,
        compactor: Arc<Compactor>,
        config: EngineConfig,
        instance_id: Uuid,
        run_mode: RunMode,
        trigger: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            store,
            model,
            registry,
            compactor,
            config,
            instance_id,
            run_mode,
            trigger,
        }
    }

    /// Worker loop: wake on notification triggers, with a periodic poll as
    /// backstop, until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.workers.run_poll_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.trigger.recv() => {}
                _ = poll.tick() => {}
            }
            if let Err(e) = self.process(&shutdown).await {
                tracing::warn!(error = %e, mode = self.run_mode.as_str(), "run worker pass failed");
            }
        }
    }

    /// One pass: continuations first (claimed runs handed back by tool
    /// completion), then fresh claims up to the concurrency budget.
    async fn process(&self, shutdown: &CancellationToken) -> Result<()> {
        let continuations = self
            .store
            .list_claimed_runs(self.instance_id, RunState::PendingApi)
            .await?;
        for run in continuations {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if run.run_mode == self.run_mode {
                self.process_run(run).await;
            }
        }

        let max = self.config.instance.max_concurrent_runs as usize;
        let claimed = self.store.claim_runs(self.instance_id, max, self.run_mode).await?;
        for run in claimed {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.process_run(run).await;
        }
        Ok(())
    }

    /// Drive one claimed run through its next iteration. Errors terminalize
    /// this run only; peers are unaffected.
    async fn process_run(&self, run: Run) {
        let span = tracing::info_span!("run", run_id = %run.id, mode = self.run_mode.as_str());
        async {
            if let Err(e) = self.process_run_inner(&run).await {
                if e.is_state_transition_failed() {
                    tracing::debug!(error = %e, "another worker advanced the run");
                    return;
                }
                tracing::warn!(error = %e, "run iteration failed");
                self.fail_run(&run, RunErrorType::Internal, &e.to_string()).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn process_run_inner(&self, run: &Run) -> Result<()> {
        // Keep the session under budget before composing input.
        if let Err(e) = self.compactor.compact_if_needed(run.session_id).await {
            tracing::warn!(error = %e, "compaction check failed, continuing with full history");
        }

        // An open iteration here means a previous claimant died mid-call.
        if let Some(orphan) = self.store.get_open_iteration(run.id).await? {
            tracing::warn!(iteration = %orphan.id, "closing orphaned iteration");
            self.store
                .complete_iteration(
                    orphan.id,
                    IterationOutcome {
                        stop_reason: Some("orphaned".into()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let run = self.store.get_run(run.id).await?;
        if run.state != RunState::PendingApi {
            return Ok(());
        }
        if run.iteration_count >= self.config.workers.max_iterations_per_run {
            self.fail_run(&run, RunErrorType::Internal, "iteration limit reached").await;
            return Ok(());
        }

        let agent = self.store.get_agent(run.agent_id).await?;
        let request = match build_model_request(self.store.as_ref(), &self.registry, &run, &agent).await {
            Ok(request) => request,
            Err(Error::BuildError(msg)) => {
                // Never call the model on malformed history.
                self.fail_run(&run, RunErrorType::BuildError, &msg).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let trigger = if run.iteration_count == 0 {
            TriggerType::UserPrompt
        } else {
            TriggerType::ToolResults
        };
        let iteration = Iteration::new(
            run.id,
            run.iteration_count + 1,
            self.run_mode == RunMode::Streaming,
            trigger,
        );
        self.store.create_iteration(&iteration).await?;

        match self.run_mode {
            RunMode::Streaming => {
                self.store
                    .update_run_state(
                        run.id,
                        RunState::Streaming,
                        RunStateUpdate::default(),
                        Some(RunState::PendingApi),
                    )
                    .await?;
                let response = match self.model.stream(request).await {
                    Ok(stream) => accumulate(stream).await,
                    Err(e) => Err(e),
                };
                match response {
                    Ok(response) => {
                        ingest_model_response(
                            self.store.as_ref(),
                            &self.config,
                            &run,
                            iteration.id,
                            response,
                            RunState::Streaming,
                        )
                        .await?;
                    }
                    Err(e) => {
                        self.close_iteration(iteration.id, "error").await;
                        self.fail_run(&run, RunErrorType::ModelError, &e.to_string()).await;
                    }
                }
            }
            RunMode::Batch => {
                let item = BatchRequestItem {
                    custom_id: iteration.id.to_string(),
                    request,
                };
                match self.model.submit_batch(vec![item]).await {
                    Ok(handle) => {
                        self.store
                            .update_iteration_batch(iteration.id, &handle.id, handle.status, false)
                            .await?;
                        self.store
                            .update_run_state(
                                run.id,
                                RunState::BatchPending,
                                RunStateUpdate::default(),
                                Some(RunState::PendingApi),
                            )
                            .await?;
                        tracing::debug!(batch_id = %handle.id, "batch submitted");
                    }
                    Err(e) => {
                        self.close_iteration(iteration.id, "error").await;
                        self.fail_run(&run, RunErrorType::ModelError, &e.to_string()).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn close_iteration(&self, iteration_id: Uuid, stop_reason: &str) {
        let outcome = IterationOutcome {
            stop_reason: Some(stop_reason.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.complete_iteration(iteration_id, outcome).await {
            tracing::debug!(error = %e, "iteration already closed");
        }
    }

    async fn fail_run(&self, run: &Run, error_type: RunErrorType, message: &str) {
        let update = RunStateUpdate::with_error(RunError::new(error_type, message));
        match self.store.update_run_state(run.id, RunState::Failed, update, None).await {
            Ok(_) => tracing::warn!(run_id = %run.id, ?error_type, message, "run failed"),
            Err(e) if e.is_state_transition_failed() => {
                tracing::debug!(run_id = %run.id, "run already terminal")
            }
            Err(e) => tracing::error!(error = %e, run_id = %run.id, "could not terminalize run"),
        }
    }
}

/// Persist one model response atomically: assistant message, tool
/// executions for each tool_use block, iteration close, and the run's next
/// state. Shared by the streaming path and the batch poller.
pub(crate) async fn ingest_model_response(
    store: &dyn Store,
    config: &EngineConfig,
    run: &Run,
    iteration_id: Uuid,
    response: ModelResponse,
    required_state: RunState,
) -> Result<()> {
    if response.content.is_empty() {
        let outcome = IterationOutcome {
            stop_reason: response.stop_reason.clone(),
            usage: response.usage,
            ..Default::default()
        };
        if let Err(e) = store.complete_iteration(iteration_id, outcome).await {
            tracing::debug!(error = %e, "iteration already closed");
        }
        store
            .update_run_state(
                run.id,
                RunState::Failed,
                RunStateUpdate::with_error(RunError::new(
                    RunErrorType::EmptyResponse,
                    "model returned an empty content list",
                )),
                None,
            )
            .await?;
        return Ok(());
    }

    let mut assistant = Message::new(run.session_id, Role::Assistant, response.content.clone()).for_run(run.id);
    assistant.usage = response.usage;

    // One pending execution per tool_use block; created_at is staggered so
    // gathered tool_result blocks keep block order.
    let mut executions = Vec::new();
    for block in &response.content {
        let am_domain::message::ContentBlock::ToolUse { id, name, input } = block else {
            continue;
        };
        let mut te = ToolExecution::new(
            run.id,
            iteration_id,
            id.clone(),
            name.clone(),
            input.clone(),
            config.tools.default_max_attempts,
        );
        te.created_at += chrono::Duration::microseconds(executions.len() as i64);
        match store.get_agent_by_name(name).await {
            Ok(agent) => te = te.as_agent_tool(agent.id),
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        executions.push(te);
    }

    let has_tool_use = !executions.is_empty();
    let new_state = if has_tool_use {
        RunState::PendingTools
    } else {
        RunState::Completed
    };
    let update = RunStateUpdate {
        response_text: (!has_tool_use).then(|| response.text()),
        error: None,
        add_usage: Some(response.usage),
    };
    let outcome = IterationOutcome {
        stop_reason: response.stop_reason.clone(),
        has_tool_use,
        tool_execution_count: executions.len() as u32,
        usage: response.usage,
    };

    store
        .record_iteration_result(RecordIterationResult {
            run_id: run.id,
            iteration_id,
            assistant_message: assistant,
            tool_executions: executions,
            iteration_outcome: outcome,
            new_state,
            required_state,
            update,
        })
        .await?;
    Ok(())
}
