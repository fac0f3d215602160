//! Durable state for AgentMesh.
//!
//! [`Store`] is the single seam every worker talks through. Two
//! implementations ship in-tree: [`MemoryStore`] (reference semantics,
//! single-process embedding and the test suite) and [`PostgresStore`]
//! (`FOR UPDATE SKIP LOCKED` claims, JSONB columns, LISTEN/NOTIFY).
//!
//! Every composite operation here is atomic: it either owns one
//! transaction (Postgres) or mutates under one write lock (memory). The
//! engine never needs a driver transaction handle.

pub mod channels;
mod memory;
pub mod payloads;
mod postgres;
mod types;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use types::{
    ApplyCompaction, EvictionReport, IterationOutcome, Notification, RecordIterationResult,
    RunFilter, RunStateUpdate,
};

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::compaction::{CompactionEvent, MessageArchive};
use am_domain::instance::{Instance, Leader};
use am_domain::iteration::{BatchStatus, Iteration};
use am_domain::message::{ContentBlock, Message};
use am_domain::run::{Run, RunMode, RunState};
use am_domain::session::Session;
use am_domain::tool_execution::ToolExecution;
use am_domain::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// A boxed stream of push notifications from the database.
pub type NotificationStream =
    std::pin::Pin<Box<dyn futures_core::Stream<Item = Result<Notification>> + Send + 'static>>;

/// Typed operations over the persisted state. Claim and completion
/// operations carry the concurrency contracts documented per method.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ── Sessions ─────────────────────────────────────────────────────

    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: Uuid) -> Result<Session>;

    // ── Agent / tool catalog ─────────────────────────────────────────

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<()>;
    async fn get_agent(&self, id: Uuid) -> Result<AgentDefinition>;
    async fn get_agent_by_name(&self, name: &str) -> Result<AgentDefinition>;
    async fn list_agents(&self) -> Result<Vec<AgentDefinition>>;
    async fn upsert_tool(&self, tool: &ToolRecord) -> Result<()>;
    async fn get_tool_by_name(&self, name: &str) -> Result<ToolRecord>;
    async fn list_tools(&self) -> Result<Vec<ToolRecord>>;

    // ── Instances ────────────────────────────────────────────────────

    /// Insert the instance row and its capability sets, then publish
    /// `instance_registered`.
    async fn register_instance(
        &self,
        instance: &Instance,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()>;

    /// Refresh `last_heartbeat_at` and replace the capability sets.
    async fn heartbeat_instance(
        &self,
        id: Uuid,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()>;

    /// Remove the instance row; publishes `instance_deregistered`.
    async fn deregister_instance(&self, id: Uuid) -> Result<()>;

    async fn get_instance(&self, id: Uuid) -> Result<Instance>;
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Release every claim held by the instance back to `pending`, then
    /// deregister it. Used by the leader against stale peers.
    async fn evict_instance(&self, id: Uuid) -> Result<EvictionReport>;

    // ── Leader ───────────────────────────────────────────────────────

    /// Insert-or-no-op on the singleton leader row; true iff this caller
    /// became leader. Publishes `leader_changed` on success.
    async fn leader_attempt_elect(&self, id: Uuid, ttl: Duration) -> Result<bool>;

    /// Extend the lease only while `leader_id` matches.
    async fn leader_attempt_reelect(&self, id: Uuid, ttl: Duration) -> Result<bool>;

    /// Delete the leader row only while `leader_id` matches. Publishes
    /// `leader_changed` with an empty payload when a row was removed.
    async fn leader_resign(&self, id: Uuid) -> Result<()>;

    async fn current_leader(&self) -> Result<Option<Leader>>;

    // ── Runs ─────────────────────────────────────────────────────────

    /// Insert a run; validates the depth/parent invariants and publishes
    /// `run_created`.
    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: Uuid) -> Result<Run>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)>;

    /// Atomically claim up to `max` pending runs of the given mode whose
    /// agent is in the instance's capability set. Claimed runs move to
    /// `pending_api` and the instance's `active_run_count` advances in the
    /// same transaction. Concurrent callers receive disjoint sets.
    async fn claim_runs(&self, instance_id: Uuid, max: usize, run_mode: RunMode) -> Result<Vec<Run>>;

    /// Runs currently claimed by this instance in the given state:
    /// continuation work after `pending_tools`.
    async fn list_claimed_runs(&self, instance_id: Uuid, state: RunState) -> Result<Vec<Run>>;

    /// Guarded state transition. Refuses to leave terminal states, refuses
    /// illegal transitions, and (when `required_state` is given) refuses
    /// unless the current state matches, all with
    /// [`am_domain::Error::StateTransitionFailed`]. Terminal writes set
    /// `finalized_at`, clear the claim, and decrement the claimer's
    /// counter. Publishes `run_state_changed`.
    async fn update_run_state(
        &self,
        id: Uuid,
        new_state: RunState,
        update: RunStateUpdate,
        required_state: Option<RunState>,
    ) -> Result<Run>;

    /// Put a claimed, non-terminal run back to `pending` and clear its
    /// claim (shutdown and reaper path).
    async fn release_run(&self, id: Uuid) -> Result<()>;

    /// Release claims older than `older_than` on non-terminal runs.
    /// Returns the released run ids.
    async fn release_expired_run_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Runs in `pending_tools` whose tool executions are all terminal:
    /// candidates for the idempotent completion rerun.
    async fn runs_with_all_tools_terminal(&self) -> Result<Vec<Uuid>>;

    // ── Iterations ───────────────────────────────────────────────────

    /// Insert an iteration. Enforces 1-based gap-free numbering and the
    /// single-open-iteration invariant; advances `run.iteration_count`.
    async fn create_iteration(&self, iteration: &Iteration) -> Result<()>;

    async fn get_iteration(&self, id: Uuid) -> Result<Iteration>;
    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>>;
    async fn get_open_iteration(&self, run_id: Uuid) -> Result<Option<Iteration>>;

    /// Close an open iteration with its observed outcome.
    async fn complete_iteration(&self, id: Uuid, outcome: IterationOutcome) -> Result<()>;

    /// Record a batch submission or poll observation on an open iteration.
    async fn update_iteration_batch(
        &self,
        id: Uuid,
        batch_id: &str,
        batch_status: BatchStatus,
        increment_poll_count: bool,
    ) -> Result<()>;

    /// Open iterations with a submitted batch, cluster-wide (poller input).
    async fn list_open_batch_iterations(&self) -> Result<Vec<Iteration>>;

    /// Atomically record one model call's outcome: close the iteration,
    /// persist the assistant message, insert the produced tool executions
    /// (publishing `tool_pending` each), and advance the run under its
    /// `required_state` guard. Either all effects are visible or none.
    async fn record_iteration_result(&self, record: RecordIterationResult) -> Result<Run>;

    // ── Tool executions ──────────────────────────────────────────────

    /// Insert the executions produced by one iteration; publishes one
    /// `tool_pending` per row.
    async fn create_tool_executions(&self, executions: &[ToolExecution]) -> Result<()>;

    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution>;
    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>>;

    /// Atomically claim up to `max` pending executions whose tool is in
    /// the instance's capability set and whose `scheduled_at` has passed.
    /// Claimed rows move to `running` and consume one attempt; a
    /// subsequent snooze refunds it.
    async fn claim_tool_executions(&self, instance_id: Uuid, max: usize) -> Result<Vec<ToolExecution>>;

    /// Terminal write: `completed` with output.
    async fn complete_tool_execution(&self, id: Uuid, output: &str) -> Result<()>;

    /// Terminal write: `failed` with an error message.
    async fn fail_tool_execution(&self, id: Uuid, message: &str) -> Result<()>;

    /// Terminal write: `skipped` (tool returned `Cancel`).
    async fn skip_tool_execution(&self, id: Uuid, message: &str) -> Result<()>;

    /// Back to `pending` at `scheduled_at`, refunding the claim's attempt
    /// (snooze does not consume one).
    async fn snooze_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Back to `pending` at `scheduled_at`, keeping the attempt count
    /// (ordinary retry with backoff).
    async fn retry_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Attach a freshly created child run to an agent-as-tool execution.
    async fn set_tool_execution_child_run(&self, id: Uuid, child_run_id: Uuid) -> Result<()>;

    /// The execution referencing `child_run_id`, if any (agent-as-tool
    /// completion propagation).
    async fn get_tool_execution_by_child_run(&self, child_run_id: Uuid) -> Result<Option<ToolExecution>>;

    /// Release expired `running` claims back to `pending` (reaper).
    async fn release_expired_tool_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    // ── Messages ─────────────────────────────────────────────────────

    /// Append one message (and its blocks) to its session.
    async fn append_message(&self, message: &Message) -> Result<()>;

    /// All messages of a session in chronological order.
    async fn get_messages(&self, session_id: Uuid) -> Result<Vec<Message>>;

    /// The message sequence needed to continue a run, excluding messages
    /// that belong to descendant (agent-as-tool) runs.
    async fn get_messages_for_run_context(&self, run_id: Uuid) -> Result<Vec<Message>>;

    /// Atomic tool-results hand-back: insert a `user` message carrying the
    /// given tool_result blocks and move the run `pending_tools →
    /// pending_api` in one transaction. Either both effects are visible or
    /// neither.
    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<()>;

    // ── Compaction ───────────────────────────────────────────────────

    /// Atomic history rewrite: write the event, archive and delete the
    /// compactable messages, insert the summary message (if any), and
    /// advance `session.compaction_count`.
    async fn apply_compaction(&self, apply: ApplyCompaction) -> Result<()>;

    async fn list_compaction_events(&self, session_id: Uuid) -> Result<Vec<CompactionEvent>>;
    async fn list_archived_messages(&self, event_id: Uuid) -> Result<Vec<MessageArchive>>;

    // ── Notifications ────────────────────────────────────────────────

    /// Publish on a named channel. Always supported.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a push listener for the named channels. `None` when the
    /// backend only supports polling; the notifier then falls back.
    async fn listen(&self, channel_names: &[&str]) -> Result<Option<NotificationStream>>;
}
