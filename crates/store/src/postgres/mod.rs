//! PostgreSQL [`Store`] implementation over `sqlx`.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, every composite operation owns one
//! transaction, and channel notifications ride `pg_notify` inside that
//! transaction so they become visible exactly when the commit does.

mod admin;
mod messages;
mod rows;
mod runs;
mod tools;

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::compaction::{CompactionEvent, MessageArchive};
use am_domain::instance::{Instance, Leader};
use am_domain::iteration::{BatchStatus, Iteration};
use am_domain::message::{ContentBlock, Message};
use am_domain::run::{Run, RunMode, RunState};
use am_domain::session::Session;
use am_domain::tool_execution::ToolExecution;
use am_domain::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::types::{
    ApplyCompaction, EvictionReport, IterationOutcome, Notification, RecordIterationResult,
    RunFilter, RunStateUpdate,
};
use crate::{NotificationStream, Store};

pub struct PostgresStore {
    pool: PgPool,
    /// Listener connections are built from the same options as the pool.
    connect_url: String,
}

impl PostgresStore {
    /// Connect and run pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(Error::storage)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(Error::storage)?;
        Ok(Self {
            pool,
            connect_url: url.to_string(),
        })
    }

    pub(super) async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(Error::storage)
    }

    /// NOTIFY inside the transaction; delivered on commit.
    pub(super) async fn notify_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        channel: &str,
        payload: &str,
    ) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    // ── Sessions ─────────────────────────────────────────────────────

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.create_session_sql(session).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.get_session_sql(id).await
    }

    // ── Agent / tool catalog ─────────────────────────────────────────

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<()> {
        self.upsert_agent_sql(agent).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentDefinition> {
        self.get_agent_sql(id).await
    }

    async fn get_agent_by_name(&self, name: &str) -> Result<AgentDefinition> {
        self.get_agent_by_name_sql(name).await
    }

    async fn list_agents(&self) -> Result<Vec<AgentDefinition>> {
        self.list_agents_sql().await
    }

    async fn upsert_tool(&self, tool: &ToolRecord) -> Result<()> {
        self.upsert_tool_sql(tool).await
    }

    async fn get_tool_by_name(&self, name: &str) -> Result<ToolRecord> {
        self.get_tool_by_name_sql(name).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolRecord>> {
        self.list_tools_sql().await
    }

    // ── Instances ────────────────────────────────────────────────────

    async fn register_instance(
        &self,
        instance: &Instance,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()> {
        self.register_instance_sql(instance, agent_names, tool_names).await
    }

    async fn heartbeat_instance(&self, id: Uuid, agent_names: &[String], tool_names: &[String]) -> Result<()> {
        self.heartbeat_instance_sql(id, agent_names, tool_names).await
    }

    async fn deregister_instance(&self, id: Uuid) -> Result<()> {
        self.deregister_instance_sql(id).await
    }

    async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.get_instance_sql(id).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.list_instances_sql().await
    }

    async fn evict_instance(&self, id: Uuid) -> Result<EvictionReport> {
        self.evict_instance_sql(id).await
    }

    // ── Leader ───────────────────────────────────────────────────────

    async fn leader_attempt_elect(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        self.leader_attempt_elect_sql(id, ttl).await
    }

    async fn leader_attempt_reelect(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        self.leader_attempt_reelect_sql(id, ttl).await
    }

    async fn leader_resign(&self, id: Uuid) -> Result<()> {
        self.leader_resign_sql(id).await
    }

    async fn current_leader(&self) -> Result<Option<Leader>> {
        self.current_leader_sql().await
    }

    // ── Runs ─────────────────────────────────────────────────────────

    async fn create_run(&self, run: &Run) -> Result<()> {
        self.create_run_sql(run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.get_run_sql(id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)> {
        self.list_runs_sql(filter).await
    }

    async fn claim_runs(&self, instance_id: Uuid, max: usize, run_mode: RunMode) -> Result<Vec<Run>> {
        self.claim_runs_sql(instance_id, max, run_mode).await
    }

    async fn list_claimed_runs(&self, instance_id: Uuid, state: RunState) -> Result<Vec<Run>> {
        self.list_claimed_runs_sql(instance_id, state).await
    }

    async fn update_run_state(
        &self,
        id: Uuid,
        new_state: RunState,
        update: RunStateUpdate,
        required_state: Option<RunState>,
    ) -> Result<Run> {
        self.update_run_state_sql(id, new_state, update, required_state).await
    }

    async fn release_run(&self, id: Uuid) -> Result<()> {
        self.release_run_sql(id).await
    }

    async fn release_expired_run_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.release_expired_run_claims_sql(older_than).await
    }

    async fn runs_with_all_tools_terminal(&self) -> Result<Vec<Uuid>> {
        self.runs_with_all_tools_terminal_sql().await
    }

    // ── Iterations ───────────────────────────────────────────────────

    async fn create_iteration(&self, iteration: &Iteration) -> Result<()> {
        self.create_iteration_sql(iteration).await
    }

    async fn get_iteration(&self, id: Uuid) -> Result<Iteration> {
        self.get_iteration_sql(id).await
    }

    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        self.list_iterations_sql(run_id).await
    }

    async fn get_open_iteration(&self, run_id: Uuid) -> Result<Option<Iteration>> {
        self.get_open_iteration_sql(run_id).await
    }

    async fn complete_iteration(&self, id: Uuid, outcome: IterationOutcome) -> Result<()> {
        self.complete_iteration_sql(id, outcome).await
    }

    async fn update_iteration_batch(
        &self,
        id: Uuid,
        batch_id: &str,
        batch_status: BatchStatus,
        increment_poll_count: bool,
    ) -> Result<()> {
        self.update_iteration_batch_sql(id, batch_id, batch_status, increment_poll_count)
            .await
    }

    async fn list_open_batch_iterations(&self) -> Result<Vec<Iteration>> {
        self.list_open_batch_iterations_sql().await
    }

    async fn record_iteration_result(&self, record: RecordIterationResult) -> Result<Run> {
        self.record_iteration_result_sql(record).await
    }

    // ── Tool executions ──────────────────────────────────────────────

    async fn create_tool_executions(&self, executions: &[ToolExecution]) -> Result<()> {
        self.create_tool_executions_sql(executions).await
    }

    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution> {
        self.get_tool_execution_sql(id).await
    }

    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        self.list_tool_executions_sql(iteration_id).await
    }

    async fn claim_tool_executions(&self, instance_id: Uuid, max: usize) -> Result<Vec<ToolExecution>> {
        self.claim_tool_executions_sql(instance_id, max).await
    }

    async fn complete_tool_execution(&self, id: Uuid, output: &str) -> Result<()> {
        self.terminalize_tool_execution_sql(id, "completed", Some(output), None).await
    }

    async fn fail_tool_execution(&self, id: Uuid, message: &str) -> Result<()> {
        self.terminalize_tool_execution_sql(id, "failed", None, Some(message)).await
    }

    async fn skip_tool_execution(&self, id: Uuid, message: &str) -> Result<()> {
        self.terminalize_tool_execution_sql(id, "skipped", None, Some(message)).await
    }

    async fn snooze_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.reschedule_tool_execution_sql(id, scheduled_at, true).await
    }

    async fn retry_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.reschedule_tool_execution_sql(id, scheduled_at, false).await
    }

    async fn set_tool_execution_child_run(&self, id: Uuid, child_run_id: Uuid) -> Result<()> {
        self.set_tool_execution_child_run_sql(id, child_run_id).await
    }

    async fn get_tool_execution_by_child_run(&self, child_run_id: Uuid) -> Result<Option<ToolExecution>> {
        self.get_tool_execution_by_child_run_sql(child_run_id).await
    }

    async fn release_expired_tool_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.release_expired_tool_claims_sql(older_than).await
    }

    // ── Messages ─────────────────────────────────────────────────────

    async fn append_message(&self, message: &Message) -> Result<()> {
        self.append_message_sql(message).await
    }

    async fn get_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        self.get_messages_sql(session_id).await
    }

    async fn get_messages_for_run_context(&self, run_id: Uuid) -> Result<Vec<Message>> {
        self.get_messages_for_run_context_sql(run_id).await
    }

    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<()> {
        self.complete_tools_and_continue_run_sql(session_id, run_id, blocks).await
    }

    // ── Compaction ───────────────────────────────────────────────────

    async fn apply_compaction(&self, apply: ApplyCompaction) -> Result<()> {
        self.apply_compaction_sql(apply).await
    }

    async fn list_compaction_events(&self, session_id: Uuid) -> Result<Vec<CompactionEvent>> {
        self.list_compaction_events_sql(session_id).await
    }

    async fn list_archived_messages(&self, event_id: Uuid) -> Result<Vec<MessageArchive>> {
        self.list_archived_messages_sql(event_id).await
    }

    // ── Notifications ────────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    async fn listen(&self, channel_names: &[&str]) -> Result<Option<NotificationStream>> {
        let mut listener = PgListener::connect(&self.connect_url).await.map_err(Error::storage)?;
        listener.listen_all(channel_names.iter().copied()).await.map_err(Error::storage)?;
        let stream = async_stream::stream! {
            loop {
                match listener.recv().await {
                    Ok(n) => {
                        yield Ok(Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        });
                    }
                    Err(e) => {
                        // Surface the error once; the notifier reconnects.
                        yield Err(Error::storage(e));
                        break;
                    }
                }
            }
        };
        Ok(Some(Box::pin(stream)))
    }
}
