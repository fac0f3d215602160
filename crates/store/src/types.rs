//! Parameter and result types for the composite [`crate::Store`]
//! operations.

use am_domain::compaction::CompactionEvent;
use am_domain::message::{Message, TokenUsage};
use am_domain::run::{RunError, RunMode, RunState};
use am_domain::tool_execution::ToolExecution;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One push notification delivered by a store listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Filter for [`crate::Store::list_runs`]. Empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub run_mode: Option<RunMode>,
    pub session_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    /// Page size; 0 means no limit.
    pub limit: usize,
    pub offset: usize,
}

/// Field updates that ride along a run state transition.
#[derive(Debug, Clone, Default)]
pub struct RunStateUpdate {
    pub response_text: Option<String>,
    pub error: Option<RunError>,
    /// Added onto the run's cumulative usage.
    pub add_usage: Option<TokenUsage>,
}

impl RunStateUpdate {
    pub fn with_error(error: RunError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Observed outcome written when an iteration closes.
#[derive(Debug, Clone, Default)]
pub struct IterationOutcome {
    pub stop_reason: Option<String>,
    pub has_tool_use: bool,
    pub tool_execution_count: u32,
    pub usage: TokenUsage,
}

/// Atomic result of one model call: close the iteration, persist the
/// assistant message, insert the produced tool executions, and advance the
/// run, all in one transaction.
#[derive(Debug, Clone)]
pub struct RecordIterationResult {
    pub run_id: Uuid,
    pub iteration_id: Uuid,
    pub assistant_message: Message,
    /// Pending executions for each tool_use block, in block order.
    pub tool_executions: Vec<ToolExecution>,
    pub iteration_outcome: IterationOutcome,
    pub new_state: RunState,
    /// Guard: the transition is refused unless the run is still here.
    pub required_state: RunState,
    pub update: RunStateUpdate,
}

/// What a stale-instance eviction released.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionReport {
    pub released_runs: u32,
    pub released_tools: u32,
}

/// Input to the atomic compaction rewrite.
#[derive(Debug, Clone)]
pub struct ApplyCompaction {
    pub session_id: Uuid,
    pub event: CompactionEvent,
    /// Messages to archive-and-delete, in chronological order.
    pub archive_message_ids: Vec<Uuid>,
    /// Messages whose blocks were rewritten in place (hybrid tool-output
    /// pruning); matched by id, blocks and usage replaced.
    pub rewrite_messages: Vec<Message>,
    /// The replacement summary message, when the strategy produced one.
    pub summary_message: Option<Message>,
}
