//! Run records and the run state machine.
//!
//! A run is one user-prompt-to-final-response invocation of an agent. Its
//! state advances only through [`RunState::can_transition_to`]; terminal
//! states are write-once and every store implementation must refuse to
//! leave them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::TokenUsage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting to be claimed by a RunWorker.
    Pending,
    /// Claimed; the worker is building model input.
    PendingApi,
    /// A batch was submitted and has not been observed in progress yet.
    BatchPending,
    /// The batch was observed in progress by the poller.
    BatchProcessing,
    /// A streaming iteration is open.
    Streaming,
    /// The last iteration produced tool_use blocks; tool executions are
    /// outstanding.
    PendingTools,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The legal transitions. Terminal states admit nothing; every
    /// non-terminal state admits `Failed` and `Cancelled`.
    pub fn can_transition_to(self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == RunState::Failed || to == RunState::Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (RunState::Pending, RunState::PendingApi)
                | (RunState::PendingApi, RunState::BatchPending)
                | (RunState::PendingApi, RunState::Streaming)
                | (RunState::BatchPending, RunState::BatchProcessing)
                | (RunState::BatchPending, RunState::Completed)
                | (RunState::BatchPending, RunState::PendingTools)
                | (RunState::BatchProcessing, RunState::Completed)
                | (RunState::BatchProcessing, RunState::PendingTools)
                | (RunState::Streaming, RunState::Completed)
                | (RunState::Streaming, RunState::PendingTools)
                | (RunState::PendingTools, RunState::PendingApi)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingApi => "pending_api",
            Self::BatchPending => "batch_pending",
            Self::BatchProcessing => "batch_processing",
            Self::Streaming => "streaming",
            Self::PendingTools => "pending_tools",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the model is called: async batch submission, or a streamed response.
/// Workers claim only runs matching their mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Batch,
    Streaming,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Streaming => "streaming",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a run terminalized as `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorType {
    /// Malformed session history; the model was never called.
    BuildError,
    /// The model returned an empty content list.
    EmptyResponse,
    /// The batch ended without a usable result.
    BatchError,
    /// The model API call itself failed.
    ModelError,
    /// A tool execution failed beyond recovery.
    ToolError,
    /// Internal failure (storage, serialization).
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    #[serde(rename = "type")]
    pub error_type: RunErrorType,
    pub message: String,
}

impl RunError {
    pub fn new(error_type: RunErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub run_mode: RunMode,
    pub prompt: String,
    pub state: RunState,
    /// 0 for top-level runs; `parent.depth + 1` for agent-as-tool children.
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_execution_id: Option<Uuid>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Final assistant text, set when the run completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_by_instance_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by_instance_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        session_id: Uuid,
        agent_id: Uuid,
        run_mode: RunMode,
        prompt: impl Into<String>,
        created_by: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            agent_id,
            run_mode,
            prompt: prompt.into(),
            state: RunState::Pending,
            depth: 0,
            parent_run_id: None,
            parent_tool_execution_id: None,
            iteration_count: 0,
            usage: TokenUsage::default(),
            response_text: None,
            error: None,
            created_by_instance_id: created_by,
            claimed_by_instance_id: None,
            claimed_at: None,
            created_at: Utc::now(),
            started_at: None,
            finalized_at: None,
        }
    }

    /// Derive a child run for an agent-as-tool execution. The child inherits
    /// the parent's session and run mode, and sits one level deeper.
    pub fn child_of(
        parent: &Run,
        agent_id: Uuid,
        tool_execution_id: Uuid,
        prompt: impl Into<String>,
        created_by: Uuid,
    ) -> Self {
        let mut run = Run::new(parent.session_id, agent_id, parent.run_mode, prompt, created_by);
        run.depth = parent.depth + 1;
        run.parent_run_id = Some(parent.id);
        run.parent_tool_execution_id = Some(tool_execution_id);
        run
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            for to in [
                RunState::Pending,
                RunState::PendingApi,
                RunState::Streaming,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn every_non_terminal_state_can_fail_or_cancel() {
        for from in [
            RunState::Pending,
            RunState::PendingApi,
            RunState::BatchPending,
            RunState::BatchProcessing,
            RunState::Streaming,
            RunState::PendingTools,
        ] {
            assert!(from.can_transition_to(RunState::Failed));
            assert!(from.can_transition_to(RunState::Cancelled));
        }
    }

    #[test]
    fn happy_paths() {
        // streaming path
        assert!(RunState::Pending.can_transition_to(RunState::PendingApi));
        assert!(RunState::PendingApi.can_transition_to(RunState::Streaming));
        assert!(RunState::Streaming.can_transition_to(RunState::PendingTools));
        assert!(RunState::PendingTools.can_transition_to(RunState::PendingApi));
        assert!(RunState::Streaming.can_transition_to(RunState::Completed));
        // batch path
        assert!(RunState::PendingApi.can_transition_to(RunState::BatchPending));
        assert!(RunState::BatchPending.can_transition_to(RunState::BatchProcessing));
        assert!(RunState::BatchProcessing.can_transition_to(RunState::Completed));
    }

    #[test]
    fn illegal_jumps_refused() {
        assert!(!RunState::Pending.can_transition_to(RunState::Streaming));
        assert!(!RunState::Pending.can_transition_to(RunState::Completed));
        assert!(!RunState::Streaming.can_transition_to(RunState::BatchPending));
        assert!(!RunState::PendingTools.can_transition_to(RunState::Completed));
    }

    #[test]
    fn child_run_inherits_and_deepens() {
        let instance = Uuid::new_v4();
        let parent = Run::new(Uuid::new_v4(), Uuid::new_v4(), RunMode::Streaming, "hi", instance);
        let te_id = Uuid::new_v4();
        let child = Run::child_of(&parent, Uuid::new_v4(), te_id, "delegate", instance);
        assert_eq!(child.session_id, parent.session_id);
        assert_eq!(child.run_mode, parent.run_mode);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_run_id, Some(parent.id));
        assert_eq!(child.parent_tool_execution_id, Some(te_id));
    }

    #[test]
    fn state_serde_snake_case() {
        let json = serde_json::to_string(&RunState::PendingApi).unwrap();
        assert_eq!(json, "\"pending_api\"");
        let back: RunState = serde_json::from_str("\"batch_processing\"").unwrap();
        assert_eq!(back, RunState::BatchProcessing);
    }
}
