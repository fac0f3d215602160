//! The tool worker — claims pending tool executions, runs them
//! concurrently under a semaphore with a hard timeout, applies the
//! Cancel/Discard/Snooze/retry policy, spawns child runs for
//! agent-as-tool executions, and hands gathered tool results back to the
//! run.

use std::sync::Arc;
use std::time::Duration;

use am_domain::config::EngineConfig;
use am_domain::message::{ContentBlock, Message};
use am_domain::run::RunState;
use am_domain::tool::ToolError;
use am_domain::tool_execution::{ToolExecution, ToolExecutionState};
use am_domain::{Error, Result};
use am_store::{channels, payloads, Store};
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::registry::Registry;

pub struct ToolWorker {
    inner: Arc<Inner>,
    trigger: mpsc::Receiver<()>,
    /// Run ids from `run_state_changed`, checked for agent-as-tool
    /// completion propagation.
    run_events: mpsc::Receiver<Uuid>,
}

struct Inner {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: EngineConfig,
    instance_id: Uuid,
    slots: Arc<Semaphore>,
}

impl ToolWorker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        config: EngineConfig,
        instance_id: Uuid,
        trigger: mpsc::Receiver<()>,
        run_events: mpsc::Receiver<Uuid>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.instance.max_concurrent_tools as usize));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                instance_id,
                slots,
            }),
            trigger,
            run_events,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(Duration::from_secs(
            self.inner.config.workers.tool_poll_interval_secs,
        ));
        let mut stuck_scan = tokio::time::interval(Duration::from_secs(
            self.inner.config.workers.stuck_scan_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.trigger.recv() => {
                    if let Err(e) = self.inner.clone().claim_and_spawn(&shutdown).await {
                        tracing::warn!(error = %e, "tool claim pass failed");
                    }
                }
                run_id = self.run_events.recv() => {
                    if let Some(run_id) = run_id {
                        if let Err(e) = self.inner.propagate_child_run(run_id).await {
                            tracing::warn!(error = %e, %run_id, "child-run propagation failed");
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.inner.clone().claim_and_spawn(&shutdown).await {
                        tracing::warn!(error = %e, "tool claim pass failed");
                    }
                }
                _ = stuck_scan.tick() => {
                    if let Err(e) = self.inner.finish_stuck_runs().await {
                        tracing::warn!(error = %e, "stuck-run completion scan failed");
                    }
                }
            }
        }
    }
}

impl Inner {
    /// Claim up to the free concurrency budget and run each execution on
    /// its own task.
    async fn claim_and_spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(());
        }
        let claimed = self.store.claim_tool_executions(self.instance_id, free).await?;
        for te in claimed {
            let inner = self.clone();
            let cancel = shutdown.child_token();
            let permit = self.slots.clone().acquire_owned().await.map_err(|_| Error::Cancelled)?;
            tokio::spawn(async move {
                let _permit = permit;
                inner.execute_one(te, cancel).await;
            });
        }
        Ok(())
    }

    async fn execute_one(&self, te: ToolExecution, cancel: CancellationToken) {
        let span = tracing::info_span!(
            "tool",
            execution_id = %te.id,
            tool = %te.tool_name,
            attempt = te.attempt_count,
        );
        async {
            let result = if te.is_agent_tool {
                self.run_agent_tool(&te).await
            } else {
                self.run_regular_tool(&te, &cancel).await
            };
            if let Err(e) = result {
                if e.is_state_transition_failed() {
                    tracing::debug!(error = %e, "execution advanced elsewhere");
                } else {
                    tracing::warn!(error = %e, "tool execution handling failed");
                }
            }
        }
        .instrument(span)
        .await
    }

    // ── Regular tools ────────────────────────────────────────────────

    async fn run_regular_tool(&self, te: &ToolExecution, cancel: &CancellationToken) -> Result<()> {
        let Some(tool) = self.registry.get_tool(&te.tool_name) else {
            // Capability filtering should prevent this; treat as permanent.
            self.store
                .fail_tool_execution(te.id, &format!("tool {} is not registered", te.tool_name))
                .await?;
            return self.maybe_finish_run(te).await;
        };

        let timeout = Duration::from_secs(self.config.tools.execution_timeout_secs);
        let outcome = tokio::time::timeout(timeout, tool.execute(cancel, te.tool_input.clone())).await;

        match outcome {
            Ok(Ok(output)) => {
                self.store.complete_tool_execution(te.id, &output).await?;
                self.maybe_finish_run(te).await
            }
            Ok(Err(ToolError::Cancel(message))) => {
                self.store.skip_tool_execution(te.id, &message).await?;
                self.maybe_finish_run(te).await
            }
            Ok(Err(ToolError::Discard(message))) => {
                self.store.fail_tool_execution(te.id, &message).await?;
                self.maybe_finish_run(te).await
            }
            Ok(Err(ToolError::Snooze(delay))) => {
                // Snooze releases the claim without consuming the attempt.
                let until = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
                tracing::debug!(?delay, "tool snoozed");
                self.store.snooze_tool_execution(te.id, until).await
            }
            Ok(Err(ToolError::Failed(message))) => self.ordinary_failure(te, &message).await,
            Err(_elapsed) => {
                self.ordinary_failure(te, &format!("timed out after {}s", timeout.as_secs()))
                    .await
            }
        }
    }

    /// Retry with `base * attempt⁴` backoff while attempts remain, else
    /// terminal failure.
    async fn ordinary_failure(&self, te: &ToolExecution, message: &str) -> Result<()> {
        if te.attempt_count < te.max_attempts {
            let delay = retry_delay(
                self.config.tools.retry_base_delay_ms,
                te.attempt_count,
                self.config.tools.max_retry_delay_secs,
            );
            tracing::warn!(
                attempt = te.attempt_count,
                max = te.max_attempts,
                ?delay,
                message,
                "tool failed, retrying"
            );
            let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store.retry_tool_execution(te.id, at).await
        } else {
            tracing::warn!(attempts = te.attempt_count, message, "tool failed permanently");
            self.store.fail_tool_execution(te.id, message).await?;
            self.maybe_finish_run(te).await
        }
    }

    // ── Agent-as-tool ────────────────────────────────────────────────

    /// First claim creates the child run; the execution then stays
    /// `running` until the child terminates. Completion propagates through
    /// `run_state_changed` (and through re-claims after a reaped timeout).
    async fn run_agent_tool(&self, te: &ToolExecution) -> Result<()> {
        let child_run_id = match te.child_run_id {
            Some(existing) => existing,
            None => {
                let agent = match self.store.get_agent_by_name(&te.tool_name).await {
                    Ok(agent) => agent,
                    Err(Error::NotFound { .. }) => {
                        self.store
                            .fail_tool_execution(te.id, &format!("agent {} is not registered", te.tool_name))
                            .await?;
                        return self.maybe_finish_run(te).await;
                    }
                    Err(e) => return Err(e),
                };
                let parent = self.store.get_run(te.run_id).await?;
                let prompt = te
                    .tool_input
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| te.tool_input.to_string());

                let child = am_domain::run::Run::child_of(&parent, agent.id, te.id, prompt.clone(), self.instance_id);
                self.store
                    .append_message(&Message::user_text(parent.session_id, prompt).for_run(child.id))
                    .await?;
                self.store.create_run(&child).await?;
                self.store.set_tool_execution_child_run(te.id, child.id).await?;
                tracing::info!(child_run = %child.id, agent = %te.tool_name, "spawned child run");
                child.id
            }
        };
        // Covers a child that already terminated (re-claim path).
        self.propagate_child_run(child_run_id).await
    }

    /// Drive an agent-as-tool execution terminal once its child run is.
    async fn propagate_child_run(&self, child_run_id: Uuid) -> Result<()> {
        let Some(te) = self.store.get_tool_execution_by_child_run(child_run_id).await? else {
            return Ok(());
        };
        if te.state != ToolExecutionState::Running {
            return Ok(());
        }
        let child = self.store.get_run(child_run_id).await?;
        let result = match child.state {
            RunState::Completed => {
                self.store
                    .complete_tool_execution(te.id, child.response_text.as_deref().unwrap_or_default())
                    .await
            }
            RunState::Failed => {
                let message = child
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "child run failed".into());
                self.store.fail_tool_execution(te.id, &message).await
            }
            RunState::Cancelled => self.store.skip_tool_execution(te.id, "child run cancelled").await,
            _ => return Ok(()),
        };
        match result {
            Ok(()) => self.maybe_finish_run(&te).await,
            Err(e) if e.is_state_transition_failed() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── All-tools-complete handling ──────────────────────────────────

    /// When every execution of the iteration is terminal, assemble the
    /// tool_result blocks (createdAt order, matching the tool_use block
    /// order) and hand the run back. Idempotent: the pending_tools guard
    /// makes the first caller win.
    async fn maybe_finish_run(&self, te: &ToolExecution) -> Result<()> {
        let executions = self.store.list_tool_executions(te.iteration_id).await?;
        if executions.is_empty() || executions.iter().any(|t| !t.is_terminal()) {
            return Ok(());
        }
        let run = self.store.get_run(te.run_id).await?;
        if run.state != RunState::PendingTools {
            return Ok(());
        }

        let mut completed_count = 0u32;
        let mut failed_count = 0u32;
        let blocks: Vec<ContentBlock> = executions
            .iter()
            .map(|t| {
                if t.state == ToolExecutionState::Completed {
                    completed_count += 1;
                    ContentBlock::tool_result(
                        t.tool_use_id.clone(),
                        t.tool_output.clone().unwrap_or_default(),
                        false,
                    )
                } else {
                    failed_count += 1;
                    ContentBlock::tool_result(
                        t.tool_use_id.clone(),
                        t.error_message.clone().unwrap_or_else(|| "tool failed".into()),
                        true,
                    )
                }
            })
            .collect();

        match self
            .store
            .complete_tools_and_continue_run(run.session_id, run.id, blocks)
            .await
        {
            Ok(()) => {
                let payload = serde_json::to_string(&payloads::RunToolsComplete {
                    run_id: run.id,
                    completed_count,
                    failed_count,
                })?;
                self.store.publish(channels::RUN_TOOLS_COMPLETE, &payload).await?;
                tracing::debug!(run_id = %run.id, completed_count, failed_count, "tool results handed back");
                Ok(())
            }
            Err(e) if e.is_state_transition_failed() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every `stuck_scan_interval`: rerun the completion step for
    /// pending_tools runs whose executions all finished while the
    /// notification was lost.
    async fn finish_stuck_runs(&self) -> Result<()> {
        for run_id in self.store.runs_with_all_tools_terminal().await? {
            let iterations = self.store.list_iterations(run_id).await?;
            let Some(latest) = iterations.last() else { continue };
            let executions = self.store.list_tool_executions(latest.id).await?;
            let Some(first) = executions.first() else { continue };
            if let Err(e) = self.maybe_finish_run(first).await {
                tracing::warn!(error = %e, %run_id, "stuck-run completion failed");
            }
        }
        Ok(())
    }
}

/// Exponential backoff: `base_ms * attempt⁴`, capped.
fn retry_delay(base_ms: u64, attempt: u32, max_secs: u64) -> Duration {
    let factor = (attempt as u64).saturating_pow(4);
    let ms = base_ms.saturating_mul(factor);
    Duration::from_millis(ms.min(max_secs.saturating_mul(1000)))
}
