//! In-process [`Store`] implementation.
//!
//! Reference semantics for the whole trait: every composite operation
//! mutates under one write lock, which gives the same atomicity the
//! Postgres implementation gets from a transaction. Powers the test suite
//! and single-instance embedding.

use std::collections::{HashMap, HashSet, VecDeque};

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::compaction::{CompactionEvent, MessageArchive};
use am_domain::instance::{Instance, Leader};
use am_domain::iteration::{BatchStatus, Iteration};
use am_domain::message::{ContentBlock, Message, Role};
use am_domain::run::{Run, RunMode, RunState};
use am_domain::session::Session;
use am_domain::tool_execution::{ToolExecution, ToolExecutionState};
use am_domain::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{
    ApplyCompaction, EvictionReport, IterationOutcome, Notification, RecordIterationResult,
    RunFilter, RunStateUpdate,
};
use crate::{channels, payloads, NotificationStream, Store};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interior state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, Session>,
    agents: HashMap<Uuid, AgentDefinition>,
    tools: HashMap<String, ToolRecord>,
    instances: HashMap<Uuid, Instance>,
    instance_agents: HashMap<Uuid, HashSet<String>>,
    instance_tools: HashMap<Uuid, HashSet<String>>,
    leader: Option<Leader>,
    runs: HashMap<Uuid, Run>,
    iterations: HashMap<Uuid, Iteration>,
    tool_executions: HashMap<Uuid, ToolExecution>,
    /// Per-session messages in insertion order.
    messages: HashMap<Uuid, Vec<Message>>,
    compaction_events: HashMap<Uuid, Vec<CompactionEvent>>,
    archives: HashMap<Uuid, Vec<MessageArchive>>,
}

/// Pending notifications collected during a mutation and flushed after the
/// lock is released.
type Outbox = VecDeque<Notification>;

pub struct MemoryStore {
    state: RwLock<State>,
    notify_tx: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(State::default()),
            notify_tx,
        }
    }

    fn flush(&self, mut outbox: Outbox) {
        while let Some(n) = outbox.pop_front() {
            // No receivers is fine; the notifier may not be running.
            let _ = self.notify_tx.send(n);
        }
    }
}

// ── helpers ─────────────────────────────────────────────────────────

fn notification(channel: &str, payload: impl Into<String>) -> Notification {
    Notification {
        channel: channel.to_string(),
        payload: payload.into(),
    }
}

fn json_payload<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn transition_refused(entity: &'static str, current: impl ToString, requested: impl ToString) -> Error {
    Error::StateTransitionFailed {
        entity,
        current: current.to_string(),
        requested: requested.to_string(),
    }
}

impl State {
    fn run(&self, id: Uuid) -> Result<&Run> {
        self.runs.get(&id).ok_or(Error::NotFound {
            entity: "run",
            id: id.to_string(),
        })
    }

    fn run_mut(&mut self, id: Uuid) -> Result<&mut Run> {
        self.runs.get_mut(&id).ok_or(Error::NotFound {
            entity: "run",
            id: id.to_string(),
        })
    }

    fn execution_mut(&mut self, id: Uuid) -> Result<&mut ToolExecution> {
        self.tool_executions.get_mut(&id).ok_or(Error::NotFound {
            entity: "tool_execution",
            id: id.to_string(),
        })
    }

    /// Latest iteration number for a run, 0 when none.
    fn latest_iteration(&self, run_id: Uuid) -> Option<&Iteration> {
        self.iterations
            .values()
            .filter(|it| it.run_id == run_id)
            .max_by_key(|it| it.iteration_number)
    }

    /// All executions belonging to one iteration, oldest first.
    fn executions_for_iteration(&self, iteration_id: Uuid) -> Vec<&ToolExecution> {
        let mut execs: Vec<&ToolExecution> = self
            .tool_executions
            .values()
            .filter(|te| te.iteration_id == iteration_id)
            .collect();
        execs.sort_by_key(|te| te.created_at);
        execs
    }

    /// Run ids reachable from `run_id` via `parent_run_id` edges, not
    /// including `run_id` itself.
    fn descendant_runs(&self, run_id: Uuid) -> HashSet<Uuid> {
        let mut descendants = HashSet::new();
        let mut frontier = vec![run_id];
        while let Some(current) = frontier.pop() {
            for run in self.runs.values() {
                if run.parent_run_id == Some(current) && descendants.insert(run.id) {
                    frontier.push(run.id);
                }
            }
        }
        descendants
    }

    /// Clear a run claim and decrement the claimant's advisory counter.
    fn release_run_claim(&mut self, run_id: Uuid) {
        if let Some(run) = self.runs.get_mut(&run_id) {
            if let Some(instance_id) = run.claimed_by_instance_id.take() {
                run.claimed_at = None;
                if let Some(instance) = self.instances.get_mut(&instance_id) {
                    instance.active_run_count = instance.active_run_count.saturating_sub(1);
                }
            }
        }
    }

    fn release_tool_claim(&mut self, execution_id: Uuid) {
        if let Some(te) = self.tool_executions.get_mut(&execution_id) {
            if let Some(instance_id) = te.claimed_by_instance_id.take() {
                if let Some(instance) = self.instances.get_mut(&instance_id) {
                    instance.active_tool_count = instance.active_tool_count.saturating_sub(1);
                }
            }
        }
    }

    /// Recompute advisory counters from actual claims.
    fn reconcile_counters(&mut self, instance_id: Uuid) {
        let run_count = self
            .runs
            .values()
            .filter(|r| r.claimed_by_instance_id == Some(instance_id) && !r.is_terminal())
            .count() as u32;
        let tool_count = self
            .tool_executions
            .values()
            .filter(|t| t.claimed_by_instance_id == Some(instance_id) && t.state == ToolExecutionState::Running)
            .count() as u32;
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.active_run_count = run_count;
            instance.active_tool_count = tool_count;
        }
    }

    fn terminalize_execution(
        &mut self,
        id: Uuid,
        state: ToolExecutionState,
        output: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let te = self.execution_mut(id)?;
        if te.state != ToolExecutionState::Running {
            return Err(transition_refused("tool_execution", te.state.as_str(), state.as_str()));
        }
        te.state = state;
        te.tool_output = output.map(str::to_string);
        te.is_error = error_message.is_some();
        te.error_message = error_message.map(str::to_string);
        te.completed_at = Some(Utc::now());
        self.release_tool_claim(id);
        Ok(())
    }

    /// Put a running execution back to `pending` at `scheduled_at`.
    fn reschedule_execution(&mut self, id: Uuid, scheduled_at: DateTime<Utc>, refund_attempt: bool) -> Result<()> {
        let te = self.execution_mut(id)?;
        if te.state != ToolExecutionState::Running {
            return Err(transition_refused("tool_execution", te.state.as_str(), "pending"));
        }
        te.state = ToolExecutionState::Pending;
        te.scheduled_at = scheduled_at;
        if refund_attempt {
            te.attempt_count = te.attempt_count.saturating_sub(1);
        }
        self.release_tool_claim(id);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Store for MemoryStore {
    // ── Sessions ─────────────────────────────────────────────────────

    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.write();
        if let Some(parent) = session.parent_session_id {
            if !state.sessions.contains_key(&parent) {
                return Err(Error::NotFound {
                    entity: "session",
                    id: parent.to_string(),
                });
            }
        }
        state.sessions.insert(session.id, session.clone());
        state.messages.entry(session.id).or_default();
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.state.read().sessions.get(&id).cloned().ok_or(Error::NotFound {
            entity: "session",
            id: id.to_string(),
        })
    }

    // ── Agent / tool catalog ─────────────────────────────────────────

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<()> {
        let mut state = self.state.write();
        // Re-registration by name keeps the original id so existing runs
        // stay resolvable.
        if let Some(existing) = state.agents.values().find(|a| a.name == agent.name).map(|a| a.id) {
            let mut updated = agent.clone();
            updated.id = existing;
            state.agents.insert(existing, updated);
        } else {
            state.agents.insert(agent.id, agent.clone());
        }
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentDefinition> {
        self.state.read().agents.get(&id).cloned().ok_or(Error::NotFound {
            entity: "agent",
            id: id.to_string(),
        })
    }

    async fn get_agent_by_name(&self, name: &str) -> Result<AgentDefinition> {
        self.state
            .read()
            .agents
            .values()
            .find(|a| a.name == name)
            .cloned()
            .ok_or(Error::NotFound {
                entity: "agent",
                id: name.to_string(),
            })
    }

    async fn list_agents(&self) -> Result<Vec<AgentDefinition>> {
        let mut agents: Vec<_> = self.state.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn upsert_tool(&self, tool: &ToolRecord) -> Result<()> {
        self.state.write().tools.insert(tool.name.clone(), tool.clone());
        Ok(())
    }

    async fn get_tool_by_name(&self, name: &str) -> Result<ToolRecord> {
        self.state.read().tools.get(name).cloned().ok_or(Error::NotFound {
            entity: "tool",
            id: name.to_string(),
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolRecord>> {
        let mut tools: Vec<_> = self.state.read().tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    // ── Instances ────────────────────────────────────────────────────

    async fn register_instance(
        &self,
        instance: &Instance,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            state.instances.insert(instance.id, instance.clone());
            state
                .instance_agents
                .insert(instance.id, agent_names.iter().cloned().collect());
            state
                .instance_tools
                .insert(instance.id, tool_names.iter().cloned().collect());
        }
        self.flush(VecDeque::from([notification(
            channels::INSTANCE_REGISTERED,
            instance.id.to_string(),
        )]));
        Ok(())
    }

    async fn heartbeat_instance(&self, id: Uuid, agent_names: &[String], tool_names: &[String]) -> Result<()> {
        let mut state = self.state.write();
        if !state.instances.contains_key(&id) {
            return Err(Error::NotFound {
                entity: "instance",
                id: id.to_string(),
            });
        }
        state.instance_agents.insert(id, agent_names.iter().cloned().collect());
        state.instance_tools.insert(id, tool_names.iter().cloned().collect());
        state.reconcile_counters(id);
        if let Some(instance) = state.instances.get_mut(&id) {
            instance.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn deregister_instance(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.state.write();
            state.instances.remove(&id);
            state.instance_agents.remove(&id);
            state.instance_tools.remove(&id);
        }
        self.flush(VecDeque::from([notification(
            channels::INSTANCE_DEREGISTERED,
            id.to_string(),
        )]));
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.state.read().instances.get(&id).cloned().ok_or(Error::NotFound {
            entity: "instance",
            id: id.to_string(),
        })
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<_> = self.state.read().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn evict_instance(&self, id: Uuid) -> Result<EvictionReport> {
        let mut outbox = Outbox::new();
        let report = {
            let mut state = self.state.write();
            let mut report = EvictionReport::default();

            let claimed_runs: Vec<Uuid> = state
                .runs
                .values()
                .filter(|r| r.claimed_by_instance_id == Some(id) && !r.is_terminal())
                .map(|r| r.id)
                .collect();
            for run_id in claimed_runs {
                state.release_run_claim(run_id);
                let run = state.run_mut(run_id)?;
                // Model not yet called (or stream died with the instance):
                // hand the run back. Batch and tool waits progress without
                // the claimant, so only the claim is cleared.
                if matches!(run.state, RunState::PendingApi | RunState::Streaming) {
                    run.state = RunState::Pending;
                    outbox.push_back(notification(channels::RUN_STATE_CHANGED, run_id.to_string()));
                }
                report.released_runs += 1;
            }

            let claimed_tools: Vec<Uuid> = state
                .tool_executions
                .values()
                .filter(|t| t.claimed_by_instance_id == Some(id) && t.state == ToolExecutionState::Running)
                .map(|t| t.id)
                .collect();
            for te_id in claimed_tools {
                state.release_tool_claim(te_id);
                if let Some(te) = state.tool_executions.get_mut(&te_id) {
                    te.state = ToolExecutionState::Pending;
                    te.scheduled_at = Utc::now();
                }
                report.released_tools += 1;
            }

            state.instances.remove(&id);
            state.instance_agents.remove(&id);
            state.instance_tools.remove(&id);
            report
        };
        outbox.push_back(notification(channels::INSTANCE_DEREGISTERED, id.to_string()));
        self.flush(outbox);
        Ok(report)
    }

    // ── Leader ───────────────────────────────────────────────────────

    async fn leader_attempt_elect(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        let elected = {
            let mut state = self.state.write();
            let now = Utc::now();
            let vacant = state.leader.as_ref().map(|l| !l.is_valid(now)).unwrap_or(true);
            if vacant {
                state.leader = Some(Leader {
                    leader_id: id,
                    elected_at: now,
                    expires_at: now + ttl,
                });
                true
            } else {
                false
            }
        };
        if elected {
            self.flush(VecDeque::from([notification(channels::LEADER_CHANGED, id.to_string())]));
        }
        Ok(elected)
    }

    async fn leader_attempt_reelect(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        let mut state = self.state.write();
        let now = Utc::now();
        match state.leader.as_mut() {
            Some(leader) if leader.leader_id == id => {
                leader.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn leader_resign(&self, id: Uuid) -> Result<()> {
        let resigned = {
            let mut state = self.state.write();
            if state.leader.as_ref().map(|l| l.leader_id) == Some(id) {
                state.leader = None;
                true
            } else {
                false
            }
        };
        if resigned {
            self.flush(VecDeque::from([notification(channels::LEADER_CHANGED, "")]));
        }
        Ok(())
    }

    async fn current_leader(&self) -> Result<Option<Leader>> {
        Ok(self.state.read().leader.clone())
    }

    // ── Runs ─────────────────────────────────────────────────────────

    async fn create_run(&self, run: &Run) -> Result<()> {
        let payload = {
            let mut state = self.state.write();
            if !state.sessions.contains_key(&run.session_id) {
                return Err(Error::NotFound {
                    entity: "session",
                    id: run.session_id.to_string(),
                });
            }
            match run.parent_run_id {
                None if run.depth != 0 => {
                    return Err(Error::BuildError("top-level run must have depth 0".into()));
                }
                Some(parent_id) => {
                    let parent = state.run(parent_id)?;
                    if run.depth != parent.depth + 1 {
                        return Err(Error::BuildError(format!(
                            "child run depth {} does not extend parent depth {}",
                            run.depth, parent.depth
                        )));
                    }
                }
                None => {}
            }
            state.runs.insert(run.id, run.clone());
            json_payload(&payloads::RunCreated {
                run_id: run.id,
                session_id: run.session_id,
                agent_id: run.agent_id,
            })
        };
        self.flush(VecDeque::from([notification(channels::RUN_CREATED, payload)]));
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.state.read().run(id).cloned()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)> {
        let state = self.state.read();
        let matches = |r: &&Run| -> bool {
            filter.state.map_or(true, |s| r.state == s)
                && filter.run_mode.map_or(true, |m| r.run_mode == m)
                && filter.session_id.map_or(true, |s| r.session_id == s)
                && filter.agent_id.map_or(true, |a| r.agent_id == a)
        };
        let mut all: Vec<&Run> = state.runs.values().filter(matches).collect();
        // Newest first, like every listing surface.
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = all.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        let page = all.into_iter().skip(filter.offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn claim_runs(&self, instance_id: Uuid, max: usize, run_mode: RunMode) -> Result<Vec<Run>> {
        let mut outbox = Outbox::new();
        let claimed = {
            let mut state = self.state.write();
            let capable: HashSet<String> = state
                .instance_agents
                .get(&instance_id)
                .cloned()
                .unwrap_or_default();

            let mut eligible: Vec<Uuid> = state
                .runs
                .values()
                .filter(|r| {
                    r.state == RunState::Pending
                        && r.run_mode == run_mode
                        && r.claimed_by_instance_id.is_none()
                        && state
                            .agents
                            .get(&r.agent_id)
                            .map(|a| capable.contains(&a.name))
                            .unwrap_or(false)
                })
                .map(|r| r.id)
                .collect();
            eligible.sort_by_key(|id| state.runs[id].created_at);
            eligible.truncate(max);

            let now = Utc::now();
            let mut claimed = Vec::with_capacity(eligible.len());
            for run_id in eligible {
                let run = state.runs.get_mut(&run_id).expect("eligible run exists");
                run.state = RunState::PendingApi;
                run.claimed_by_instance_id = Some(instance_id);
                run.claimed_at = Some(now);
                run.started_at.get_or_insert(now);
                claimed.push(run.clone());
                outbox.push_back(notification(channels::RUN_STATE_CHANGED, run_id.to_string()));
            }
            if let Some(instance) = state.instances.get_mut(&instance_id) {
                instance.active_run_count += claimed.len() as u32;
            }
            claimed
        };
        self.flush(outbox);
        Ok(claimed)
    }

    async fn list_claimed_runs(&self, instance_id: Uuid, state: RunState) -> Result<Vec<Run>> {
        let guard = self.state.read();
        let mut runs: Vec<Run> = guard
            .runs
            .values()
            .filter(|r| r.claimed_by_instance_id == Some(instance_id) && r.state == state)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn update_run_state(
        &self,
        id: Uuid,
        new_state: RunState,
        update: RunStateUpdate,
        required_state: Option<RunState>,
    ) -> Result<Run> {
        let updated = {
            let mut state = self.state.write();
            let current = state.run(id)?.state;
            if let Some(required) = required_state {
                if current != required {
                    return Err(transition_refused("run", current.as_str(), new_state.as_str()));
                }
            }
            if !current.can_transition_to(new_state) {
                return Err(transition_refused("run", current.as_str(), new_state.as_str()));
            }

            let run = state.run_mut(id)?;
            run.state = new_state;
            if let Some(text) = update.response_text {
                run.response_text = Some(text);
            }
            if let Some(error) = update.error {
                run.error = Some(error);
            }
            if let Some(usage) = update.add_usage {
                run.usage.add(&usage);
            }
            if new_state.is_terminal() {
                run.finalized_at = Some(Utc::now());
                state.release_run_claim(id);
            }
            state.run(id)?.clone()
        };
        self.flush(VecDeque::from([notification(channels::RUN_STATE_CHANGED, id.to_string())]));
        Ok(updated)
    }

    async fn release_run(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.state.write();
            let current = state.run(id)?.state;
            if current.is_terminal() {
                return Err(transition_refused("run", current.as_str(), "pending"));
            }
            state.release_run_claim(id);
            state.run_mut(id)?.state = RunState::Pending;
        }
        self.flush(VecDeque::from([notification(channels::RUN_STATE_CHANGED, id.to_string())]));
        Ok(())
    }

    async fn release_expired_run_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut outbox = Outbox::new();
        let released = {
            let mut state = self.state.write();
            let expired: Vec<(Uuid, RunState)> = state
                .runs
                .values()
                .filter(|r| {
                    !r.is_terminal()
                        && r.claimed_by_instance_id.is_some()
                        && r.claimed_at.map(|at| at < older_than).unwrap_or(false)
                })
                .map(|r| (r.id, r.state))
                .collect();

            let mut released = Vec::new();
            for (run_id, run_state) in expired {
                state.release_run_claim(run_id);
                // Only states that need a live claimant go back to pending;
                // batch and tool waits progress without one.
                if matches!(run_state, RunState::PendingApi | RunState::Streaming) {
                    state.run_mut(run_id)?.state = RunState::Pending;
                }
                outbox.push_back(notification(channels::RUN_STATE_CHANGED, run_id.to_string()));
                released.push(run_id);
            }
            released
        };
        self.flush(outbox);
        Ok(released)
    }

    async fn runs_with_all_tools_terminal(&self) -> Result<Vec<Uuid>> {
        let state = self.state.read();
        let mut ready = Vec::new();
        for run in state.runs.values() {
            if run.state != RunState::PendingTools {
                continue;
            }
            let Some(iteration) = state.latest_iteration(run.id) else {
                continue;
            };
            let execs = state.executions_for_iteration(iteration.id);
            if !execs.is_empty() && execs.iter().all(|te| te.is_terminal()) {
                ready.push(run.id);
            }
        }
        Ok(ready)
    }

    // ── Iterations ───────────────────────────────────────────────────

    async fn create_iteration(&self, iteration: &Iteration) -> Result<()> {
        let mut state = self.state.write();
        let run = state.run(iteration.run_id)?;
        let expected = run.iteration_count + 1;
        if iteration.iteration_number != expected {
            return Err(transition_refused(
                "iteration",
                format!("next number {expected}"),
                iteration.iteration_number,
            ));
        }
        if let Some(open) = state.latest_iteration(iteration.run_id) {
            if open.is_open() {
                return Err(transition_refused("iteration", "open", "second open iteration"));
            }
        }
        state.iterations.insert(iteration.id, iteration.clone());
        state.run_mut(iteration.run_id)?.iteration_count = expected;
        Ok(())
    }

    async fn get_iteration(&self, id: Uuid) -> Result<Iteration> {
        self.state.read().iterations.get(&id).cloned().ok_or(Error::NotFound {
            entity: "iteration",
            id: id.to_string(),
        })
    }

    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        let state = self.state.read();
        let mut iterations: Vec<Iteration> = state
            .iterations
            .values()
            .filter(|it| it.run_id == run_id)
            .cloned()
            .collect();
        iterations.sort_by_key(|it| it.iteration_number);
        Ok(iterations)
    }

    async fn get_open_iteration(&self, run_id: Uuid) -> Result<Option<Iteration>> {
        let state = self.state.read();
        Ok(state
            .iterations
            .values()
            .find(|it| it.run_id == run_id && it.is_open())
            .cloned())
    }

    async fn complete_iteration(&self, id: Uuid, outcome: IterationOutcome) -> Result<()> {
        let mut state = self.state.write();
        let iteration = state.iterations.get_mut(&id).ok_or(Error::NotFound {
            entity: "iteration",
            id: id.to_string(),
        })?;
        if !iteration.is_open() {
            return Err(transition_refused("iteration", "completed", "completed"));
        }
        iteration.stop_reason = outcome.stop_reason;
        iteration.has_tool_use = outcome.has_tool_use;
        iteration.tool_execution_count = outcome.tool_execution_count;
        iteration.usage = outcome.usage;
        iteration.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn update_iteration_batch(
        &self,
        id: Uuid,
        batch_id: &str,
        batch_status: BatchStatus,
        increment_poll_count: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        let iteration = state.iterations.get_mut(&id).ok_or(Error::NotFound {
            entity: "iteration",
            id: id.to_string(),
        })?;
        iteration.batch_id = Some(batch_id.to_string());
        iteration.batch_status = Some(batch_status);
        if increment_poll_count {
            iteration.batch_poll_count += 1;
        }
        Ok(())
    }

    async fn list_open_batch_iterations(&self) -> Result<Vec<Iteration>> {
        let state = self.state.read();
        let mut iterations: Vec<Iteration> = state
            .iterations
            .values()
            .filter(|it| it.is_open() && it.batch_id.is_some())
            .cloned()
            .collect();
        iterations.sort_by_key(|it| it.started_at);
        Ok(iterations)
    }

    async fn record_iteration_result(&self, record: RecordIterationResult) -> Result<Run> {
        let mut outbox = Outbox::new();
        let updated = {
            let mut state = self.state.write();

            // Guard everything before mutating anything.
            let run = state.run(record.run_id)?;
            if run.state != record.required_state {
                return Err(transition_refused("run", run.state.as_str(), record.new_state.as_str()));
            }
            if !run.state.can_transition_to(record.new_state) {
                return Err(transition_refused("run", run.state.as_str(), record.new_state.as_str()));
            }
            let session_id = run.session_id;
            let iteration = state.iterations.get(&record.iteration_id).ok_or(Error::NotFound {
                entity: "iteration",
                id: record.iteration_id.to_string(),
            })?;
            if !iteration.is_open() {
                return Err(transition_refused("iteration", "completed", "completed"));
            }

            // Iteration close.
            let iteration = state
                .iterations
                .get_mut(&record.iteration_id)
                .expect("checked above");
            iteration.stop_reason = record.iteration_outcome.stop_reason.clone();
            iteration.has_tool_use = record.iteration_outcome.has_tool_use;
            iteration.tool_execution_count = record.iteration_outcome.tool_execution_count;
            iteration.usage = record.iteration_outcome.usage;
            iteration.completed_at = Some(Utc::now());

            // Assistant message.
            state
                .messages
                .entry(session_id)
                .or_default()
                .push(record.assistant_message.clone());

            // Produced tool executions.
            for te in &record.tool_executions {
                state.tool_executions.insert(te.id, te.clone());
                outbox.push_back(notification(
                    channels::TOOL_PENDING,
                    json_payload(&payloads::ToolPending {
                        tool_execution_id: te.id,
                        run_id: te.run_id,
                        tool_name: te.tool_name.clone(),
                    }),
                ));
            }

            // Run transition.
            let run = state.run_mut(record.run_id)?;
            run.state = record.new_state;
            if let Some(text) = record.update.response_text.clone() {
                run.response_text = Some(text);
            }
            if let Some(error) = record.update.error.clone() {
                run.error = Some(error);
            }
            if let Some(usage) = record.update.add_usage {
                run.usage.add(&usage);
            }
            if record.new_state.is_terminal() {
                run.finalized_at = Some(Utc::now());
                state.release_run_claim(record.run_id);
            }
            outbox.push_back(notification(channels::RUN_STATE_CHANGED, record.run_id.to_string()));
            state.run(record.run_id)?.clone()
        };
        self.flush(outbox);
        Ok(updated)
    }

    // ── Tool executions ──────────────────────────────────────────────

    async fn create_tool_executions(&self, executions: &[ToolExecution]) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.write();
            for te in executions {
                state.run(te.run_id)?;
                state.tool_executions.insert(te.id, te.clone());
                outbox.push_back(notification(
                    channels::TOOL_PENDING,
                    json_payload(&payloads::ToolPending {
                        tool_execution_id: te.id,
                        run_id: te.run_id,
                        tool_name: te.tool_name.clone(),
                    }),
                ));
            }
        }
        self.flush(outbox);
        Ok(())
    }

    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution> {
        self.state.read().tool_executions.get(&id).cloned().ok_or(Error::NotFound {
            entity: "tool_execution",
            id: id.to_string(),
        })
    }

    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        let state = self.state.read();
        Ok(state
            .executions_for_iteration(iteration_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn claim_tool_executions(&self, instance_id: Uuid, max: usize) -> Result<Vec<ToolExecution>> {
        let mut state = self.state.write();
        let capable_tools = state.instance_tools.get(&instance_id).cloned().unwrap_or_default();
        let capable_agents = state.instance_agents.get(&instance_id).cloned().unwrap_or_default();

        let now = Utc::now();
        let mut eligible: Vec<Uuid> = state
            .tool_executions
            .values()
            .filter(|te| {
                te.state == ToolExecutionState::Pending
                    && te.scheduled_at <= now
                    && if te.is_agent_tool {
                        capable_agents.contains(&te.tool_name)
                    } else {
                        capable_tools.contains(&te.tool_name)
                    }
            })
            .map(|te| te.id)
            .collect();
        eligible.sort_by_key(|id| {
            let te = &state.tool_executions[id];
            (te.scheduled_at, te.created_at)
        });
        eligible.truncate(max);

        let mut claimed = Vec::with_capacity(eligible.len());
        for te_id in eligible {
            let te = state.tool_executions.get_mut(&te_id).expect("eligible execution exists");
            te.state = ToolExecutionState::Running;
            te.claimed_by_instance_id = Some(instance_id);
            te.started_at = Some(now);
            // A claim consumes an attempt; snooze refunds it.
            te.attempt_count += 1;
            claimed.push(te.clone());
        }
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.active_tool_count += claimed.len() as u32;
        }
        Ok(claimed)
    }

    async fn complete_tool_execution(&self, id: Uuid, output: &str) -> Result<()> {
        self.state
            .write()
            .terminalize_execution(id, ToolExecutionState::Completed, Some(output), None)
    }

    async fn fail_tool_execution(&self, id: Uuid, message: &str) -> Result<()> {
        self.state
            .write()
            .terminalize_execution(id, ToolExecutionState::Failed, None, Some(message))
    }

    async fn skip_tool_execution(&self, id: Uuid, message: &str) -> Result<()> {
        self.state
            .write()
            .terminalize_execution(id, ToolExecutionState::Skipped, None, Some(message))
    }

    async fn snooze_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.state.write().reschedule_execution(id, scheduled_at, true)
    }

    async fn retry_tool_execution(&self, id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.state.write().reschedule_execution(id, scheduled_at, false)
    }

    async fn set_tool_execution_child_run(&self, id: Uuid, child_run_id: Uuid) -> Result<()> {
        let mut state = self.state.write();
        let te = state.execution_mut(id)?;
        te.child_run_id = Some(child_run_id);
        Ok(())
    }

    async fn get_tool_execution_by_child_run(&self, child_run_id: Uuid) -> Result<Option<ToolExecution>> {
        let state = self.state.read();
        Ok(state
            .tool_executions
            .values()
            .find(|te| te.child_run_id == Some(child_run_id))
            .cloned())
    }

    async fn release_expired_tool_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write();
        let expired: Vec<Uuid> = state
            .tool_executions
            .values()
            .filter(|te| {
                te.state == ToolExecutionState::Running
                    && te.started_at.map(|at| at < older_than).unwrap_or(false)
            })
            .map(|te| te.id)
            .collect();
        for te_id in &expired {
            state.release_tool_claim(*te_id);
            if let Some(te) = state.tool_executions.get_mut(te_id) {
                te.state = ToolExecutionState::Pending;
                te.scheduled_at = Utc::now();
            }
        }
        Ok(expired)
    }

    // ── Messages ─────────────────────────────────────────────────────

    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(&message.session_id) {
            return Err(Error::NotFound {
                entity: "session",
                id: message.session_id.to_string(),
            });
        }
        validate_tool_result_references(
            state.messages.get(&message.session_id).map(Vec::as_slice).unwrap_or(&[]),
            message,
        )?;
        state.messages.entry(message.session_id).or_default().push(message.clone());
        if let Some(session) = state.sessions.get_mut(&message.session_id) {
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let state = self.state.read();
        Ok(state.messages.get(&session_id).cloned().unwrap_or_default())
    }

    async fn get_messages_for_run_context(&self, run_id: Uuid) -> Result<Vec<Message>> {
        let state = self.state.read();
        let run = state.run(run_id)?;
        let descendants = state.descendant_runs(run_id);
        Ok(state
            .messages
            .get(&run.session_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.run_id.map(|rid| !descendants.contains(&rid)).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<()> {
        let next_state = {
            let mut state = self.state.write();
            let run = state.run(run_id)?;
            if run.state != RunState::PendingTools {
                return Err(transition_refused("run", run.state.as_str(), "pending_api"));
            }
            // An orphaned claim routes the continuation through `pending`
            // so any instance can pick it up.
            let next_state = if run.claimed_by_instance_id.is_some() {
                RunState::PendingApi
            } else {
                RunState::Pending
            };

            let message = Message::new(session_id, Role::User, blocks).for_run(run_id);
            validate_tool_result_references(
                state.messages.get(&session_id).map(Vec::as_slice).unwrap_or(&[]),
                &message,
            )?;
            state.messages.entry(session_id).or_default().push(message);
            state.run_mut(run_id)?.state = next_state;
            next_state
        };
        tracing::debug!(%run_id, next_state = next_state.as_str(), "tool results handed back");
        self.flush(VecDeque::from([notification(channels::RUN_STATE_CHANGED, run_id.to_string())]));
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────────────

    async fn apply_compaction(&self, apply: ApplyCompaction) -> Result<()> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(&apply.session_id) {
            return Err(Error::NotFound {
                entity: "session",
                id: apply.session_id.to_string(),
            });
        }

        let archive_set: HashSet<Uuid> = apply.archive_message_ids.iter().copied().collect();
        let messages = state.messages.entry(apply.session_id).or_default();

        // Validate before any mutation so a bad input leaves the session
        // untouched.
        let present = messages.iter().filter(|m| archive_set.contains(&m.id)).count();
        if present != archive_set.len() {
            return Err(Error::NotFound {
                entity: "message",
                id: "archive set references unknown messages".into(),
            });
        }
        let first_removed = messages.iter().position(|m| archive_set.contains(&m.id));

        // Archive full bodies, then apply the in-place rewrites (hybrid
        // tool-output pruning) and the deletion.
        let mut archives = Vec::with_capacity(archive_set.len());
        for message in messages.iter().filter(|m| archive_set.contains(&m.id)) {
            archives.push(MessageArchive {
                id: Uuid::new_v4(),
                compaction_event_id: apply.event.id,
                message_id: message.id,
                session_id: apply.session_id,
                body: serde_json::to_value(message)?,
                archived_at: Utc::now(),
            });
        }
        for rewrite in &apply.rewrite_messages {
            if let Some(existing) = messages.iter_mut().find(|m| m.id == rewrite.id) {
                existing.blocks = rewrite.blocks.clone();
                existing.usage = rewrite.usage;
            }
        }

        messages.retain(|m| !archive_set.contains(&m.id));
        if let Some(summary) = apply.summary_message {
            let at = first_removed.unwrap_or(0).min(messages.len());
            messages.insert(at, summary);
        }

        state.archives.insert(apply.event.id, archives);
        state
            .compaction_events
            .entry(apply.session_id)
            .or_default()
            .push(apply.event);
        if let Some(session) = state.sessions.get_mut(&apply.session_id) {
            session.compaction_count += 1;
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_compaction_events(&self, session_id: Uuid) -> Result<Vec<CompactionEvent>> {
        let state = self.state.read();
        Ok(state.compaction_events.get(&session_id).cloned().unwrap_or_default())
    }

    async fn list_archived_messages(&self, event_id: Uuid) -> Result<Vec<MessageArchive>> {
        let state = self.state.read();
        Ok(state.archives.get(&event_id).cloned().unwrap_or_default())
    }

    // ── Notifications ────────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _ = self.notify_tx.send(notification(channel, payload));
        Ok(())
    }

    async fn listen(&self, channel_names: &[&str]) -> Result<Option<NotificationStream>> {
        let wanted: HashSet<String> = channel_names.iter().map(|s| s.to_string()).collect();
        let mut rx = self.notify_tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(n) if wanted.contains(&n.channel) => yield Ok(n),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notification listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Some(Box::pin(stream)))
    }
}

/// Refuse a message whose tool_result blocks reference a tool_use id that
/// no earlier message in the session carries.
fn validate_tool_result_references(history: &[Message], message: &Message) -> Result<()> {
    let result_ids: Vec<&str> = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
        .collect();
    if result_ids.is_empty() {
        return Ok(());
    }
    let known: HashSet<&str> = history.iter().flat_map(|m| m.tool_use_ids()).collect();
    for id in result_ids {
        if !known.contains(id) {
            return Err(Error::BuildError(format!(
                "tool_result references unknown tool_use id {id}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_domain::run::{RunError, RunErrorType};

    async fn seeded() -> (MemoryStore, Session, AgentDefinition, Instance) {
        let store = MemoryStore::new();
        let session = Session::new("t1", "s1");
        store.create_session(&session).await.unwrap();
        let agent = AgentDefinition::new("helper", "mock", "You help.", 1024);
        store.upsert_agent(&agent).await.unwrap();
        let instance = Instance::new("w1", "host", 7, "0.1.0", 4, 8);
        store
            .register_instance(&instance, &["helper".into()], &["get_weather".into()])
            .await
            .unwrap();
        (store, session, agent, instance)
    }

    fn pending_run(session: &Session, agent: &AgentDefinition, instance: &Instance) -> Run {
        Run::new(session.id, agent.id, RunMode::Streaming, "hi", instance.id)
    }

    #[tokio::test]
    async fn claim_respects_capability_and_mode() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();

        // Wrong mode claims nothing.
        let claimed = store.claim_runs(instance.id, 10, RunMode::Batch).await.unwrap();
        assert!(claimed.is_empty());

        // Instance without the agent capability claims nothing.
        let other = Instance::new("w2", "host", 8, "0.1.0", 4, 8);
        store.register_instance(&other, &[], &[]).await.unwrap();
        let claimed = store.claim_runs(other.id, 10, RunMode::Streaming).await.unwrap();
        assert!(claimed.is_empty());

        let claimed = store.claim_runs(instance.id, 10, RunMode::Streaming).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state, RunState::PendingApi);
        assert_eq!(claimed[0].claimed_by_instance_id, Some(instance.id));
        assert_eq!(store.get_instance(instance.id).await.unwrap().active_run_count, 1);

        // Second claim finds nothing left.
        let again = store.claim_runs(instance.id, 10, RunMode::Streaming).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let (store, session, agent, instance) = seeded().await;
        let store = std::sync::Arc::new(store);
        let other = Instance::new("w2", "host", 8, "0.1.0", 4, 8);
        store.register_instance(&other, &["helper".into()], &[]).await.unwrap();

        for _ in 0..6 {
            store
                .create_run(&pending_run(&session, &agent, &instance))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            store.claim_runs(instance.id, 4, RunMode::Streaming),
            store.claim_runs(other.id, 4, RunMode::Streaming),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        let mut ids: Vec<Uuid> = a.iter().chain(b.iter()).map(|r| r.id).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "claims overlapped");
        assert_eq!(before, 6.min(4 + 4).min(6));
    }

    #[tokio::test]
    async fn terminal_states_are_write_once() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();
        store.claim_runs(instance.id, 1, RunMode::Streaming).await.unwrap();
        store
            .update_run_state(run.id, RunState::Streaming, RunStateUpdate::default(), None)
            .await
            .unwrap();
        store
            .update_run_state(run.id, RunState::Completed, RunStateUpdate::default(), None)
            .await
            .unwrap();

        let err = store
            .update_run_state(run.id, RunState::Failed, RunStateUpdate::default(), None)
            .await
            .unwrap_err();
        assert!(err.is_state_transition_failed());
        let stored = store.get_run(run.id).await.unwrap();
        assert_eq!(stored.state, RunState::Completed);
        assert!(stored.finalized_at.is_some());
        assert!(stored.claimed_by_instance_id.is_none());
    }

    #[tokio::test]
    async fn required_state_guard() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();
        let err = store
            .update_run_state(
                run.id,
                RunState::Failed,
                RunStateUpdate::with_error(RunError::new(RunErrorType::Internal, "x")),
                Some(RunState::Streaming),
            )
            .await
            .unwrap_err();
        assert!(err.is_state_transition_failed());
        assert_eq!(store.get_run(run.id).await.unwrap().state, RunState::Pending);
    }

    #[tokio::test]
    async fn iteration_numbering_is_gap_free() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();

        let it1 = Iteration::new(run.id, 1, true, am_domain::iteration::TriggerType::UserPrompt);
        store.create_iteration(&it1).await.unwrap();

        // Second open iteration refused.
        let it_dup = Iteration::new(run.id, 2, true, am_domain::iteration::TriggerType::ToolResults);
        assert!(store.create_iteration(&it_dup).await.is_err());

        store.complete_iteration(it1.id, IterationOutcome::default()).await.unwrap();

        // Wrong number refused.
        let it_gap = Iteration::new(run.id, 3, true, am_domain::iteration::TriggerType::ToolResults);
        assert!(store.create_iteration(&it_gap).await.is_err());

        let it2 = Iteration::new(run.id, 2, true, am_domain::iteration::TriggerType::ToolResults);
        store.create_iteration(&it2).await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().iteration_count, 2);
    }

    #[tokio::test]
    async fn snooze_refunds_attempt_retry_keeps_it() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();
        let it = Iteration::new(run.id, 1, true, am_domain::iteration::TriggerType::UserPrompt);
        store.create_iteration(&it).await.unwrap();
        let te = ToolExecution::new(run.id, it.id, "t1", "get_weather", serde_json::json!({}), 3);
        store.create_tool_executions(&[te.clone()]).await.unwrap();

        let claimed = store.claim_tool_executions(instance.id, 4).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, 1);

        store.snooze_tool_execution(te.id, Utc::now()).await.unwrap();
        assert_eq!(store.get_tool_execution(te.id).await.unwrap().attempt_count, 0);

        let claimed = store.claim_tool_executions(instance.id, 4).await.unwrap();
        assert_eq!(claimed[0].attempt_count, 1);
        store.retry_tool_execution(te.id, Utc::now()).await.unwrap();
        assert_eq!(store.get_tool_execution(te.id).await.unwrap().attempt_count, 1);

        let claimed = store.claim_tool_executions(instance.id, 4).await.unwrap();
        assert_eq!(claimed[0].attempt_count, 2);
        store.complete_tool_execution(te.id, "sunny").await.unwrap();
        let done = store.get_tool_execution(te.id).await.unwrap();
        assert_eq!(done.state, ToolExecutionState::Completed);
        assert_eq!(done.tool_output.as_deref(), Some("sunny"));
        assert_eq!(store.get_instance(instance.id).await.unwrap().active_tool_count, 0);
    }

    #[tokio::test]
    async fn scheduled_at_gates_claims() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();
        let it = Iteration::new(run.id, 1, true, am_domain::iteration::TriggerType::UserPrompt);
        store.create_iteration(&it).await.unwrap();
        let mut te = ToolExecution::new(run.id, it.id, "t1", "get_weather", serde_json::json!({}), 3);
        te.scheduled_at = Utc::now() + Duration::seconds(60);
        store.create_tool_executions(&[te]).await.unwrap();

        let claimed = store.claim_tool_executions(instance.id, 4).await.unwrap();
        assert!(claimed.is_empty(), "future-scheduled execution was claimed");
    }

    #[tokio::test]
    async fn complete_tools_and_continue_is_guarded_and_atomic() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();

        // Run is not in pending_tools: nothing must change.
        let err = store
            .complete_tools_and_continue_run(session.id, run.id, vec![ContentBlock::tool_result("t1", "ok", false)])
            .await
            .unwrap_err();
        assert!(err.is_state_transition_failed());
        assert!(store.get_messages(session.id).await.unwrap().is_empty());
        assert_eq!(store.get_run(run.id).await.unwrap().state, RunState::Pending);
    }

    #[tokio::test]
    async fn tool_result_requires_matching_tool_use() {
        let (store, session, _agent, _instance) = seeded().await;
        let orphan = Message::new(
            session.id,
            Role::User,
            vec![ContentBlock::tool_result("missing", "out", false)],
        );
        assert!(store.append_message(&orphan).await.is_err());

        let mut assistant = Message::assistant_text(session.id, "calling");
        assistant.blocks.push(ContentBlock::tool_use("t1", "x", serde_json::json!({})));
        store.append_message(&assistant).await.unwrap();
        let result = Message::new(
            session.id,
            Role::User,
            vec![ContentBlock::tool_result("t1", "out", false)],
        );
        store.append_message(&result).await.unwrap();
    }

    #[tokio::test]
    async fn run_context_excludes_descendants() {
        let (store, session, agent, instance) = seeded().await;
        let parent = pending_run(&session, &agent, &instance);
        store.create_run(&parent).await.unwrap();
        let child = Run::child_of(&parent, agent.id, Uuid::new_v4(), "sub", instance.id);
        store.create_run(&child).await.unwrap();

        store
            .append_message(&Message::user_text(session.id, "parent prompt").for_run(parent.id))
            .await
            .unwrap();
        store
            .append_message(&Message::user_text(session.id, "child prompt").for_run(child.id))
            .await
            .unwrap();
        store
            .append_message(&Message::assistant_text(session.id, "child answer").for_run(child.id))
            .await
            .unwrap();

        let ctx = store.get_messages_for_run_context(parent.id).await.unwrap();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].text(), "parent prompt");

        let child_ctx = store.get_messages_for_run_context(child.id).await.unwrap();
        assert_eq!(child_ctx.len(), 3);
    }

    #[tokio::test]
    async fn leader_election_cycle() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::seconds(30);

        assert!(store.leader_attempt_elect(a, ttl).await.unwrap());
        assert!(!store.leader_attempt_elect(b, ttl).await.unwrap());
        assert!(store.leader_attempt_reelect(a, ttl).await.unwrap());
        assert!(!store.leader_attempt_reelect(b, ttl).await.unwrap());

        store.leader_resign(a).await.unwrap();
        assert!(store.current_leader().await.unwrap().is_none());
        assert!(store.leader_attempt_elect(b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.leader_attempt_elect(a, Duration::milliseconds(-1)).await.unwrap());
        // Already expired, so b wins immediately.
        assert!(store.leader_attempt_elect(b, Duration::seconds(30)).await.unwrap());
        assert_eq!(store.current_leader().await.unwrap().unwrap().leader_id, b);
    }

    #[tokio::test]
    async fn eviction_releases_claims() {
        let (store, session, agent, instance) = seeded().await;
        let run = pending_run(&session, &agent, &instance);
        store.create_run(&run).await.unwrap();
        store.claim_runs(instance.id, 1, RunMode::Streaming).await.unwrap();

        let report = store.evict_instance(instance.id).await.unwrap();
        assert_eq!(report.released_runs, 1);
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert!(run.claimed_by_instance_id.is_none());
        assert!(store.get_instance(instance.id).await.is_err());
    }

    #[tokio::test]
    async fn listen_delivers_published_notifications() {
        use futures_util::StreamExt;
        let store = MemoryStore::new();
        let mut stream = store.listen(&[channels::RUN_CREATED]).await.unwrap().unwrap();
        store.publish(channels::TOOL_PENDING, "ignored").await.unwrap();
        store.publish(channels::RUN_CREATED, "yes").await.unwrap();
        let n = stream.next().await.unwrap().unwrap();
        assert_eq!(n.channel, channels::RUN_CREATED);
        assert_eq!(n.payload, "yes");
    }

    #[tokio::test]
    async fn apply_compaction_rewrites_history() {
        let (store, session, _agent, _instance) = seeded().await;
        let m1 = Message::user_text(session.id, "old 1");
        let m2 = Message::assistant_text(session.id, "old 2");
        let m3 = Message::user_text(session.id, "recent");
        for m in [&m1, &m2, &m3] {
            store.append_message(m).await.unwrap();
        }

        let summary = Message {
            is_summary: true,
            ..Message::assistant_text(session.id, "summary of old")
        };
        let event = CompactionEvent {
            id: Uuid::new_v4(),
            session_id: session.id,
            strategy: "summarization".into(),
            original_tokens: 100,
            compacted_tokens: 40,
            messages_removed: 2,
            summary_content: Some("summary of old".into()),
            preserved_message_ids: vec![m3.id],
            model_used: Some("mock".into()),
            duration_ms: 5,
            created_at: Utc::now(),
        };
        store
            .apply_compaction(ApplyCompaction {
                session_id: session.id,
                event: event.clone(),
                archive_message_ids: vec![m1.id, m2.id],
                rewrite_messages: vec![],
                summary_message: Some(summary.clone()),
            })
            .await
            .unwrap();

        let messages = store.get_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_summary);
        assert_eq!(messages[1].id, m3.id);

        assert_eq!(store.get_session(session.id).await.unwrap().compaction_count, 1);
        let events = store.list_compaction_events(session.id).await.unwrap();
        assert_eq!(events.len(), 1);
        let archived = store.list_archived_messages(event.id).await.unwrap();
        assert_eq!(archived.len(), 2);
        // Archived union surviving ids equals the original id set.
        let mut all: Vec<Uuid> = archived.iter().map(|a| a.message_id).collect();
        all.push(m3.id);
        all.sort();
        let mut original = vec![m1.id, m2.id, m3.id];
        original.sort();
        assert_eq!(all, original);
    }

    #[tokio::test]
    async fn depth_invariants_enforced() {
        let (store, session, agent, instance) = seeded().await;
        let mut bad = pending_run(&session, &agent, &instance);
        bad.depth = 1;
        assert!(store.create_run(&bad).await.is_err());

        let parent = pending_run(&session, &agent, &instance);
        store.create_run(&parent).await.unwrap();
        let mut child = Run::child_of(&parent, agent.id, Uuid::new_v4(), "sub", instance.id);
        child.depth = 5;
        assert!(store.create_run(&child).await.is_err());
    }
}
