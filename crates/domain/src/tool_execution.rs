use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionState {
    /// Waiting to be claimed (initial state, and the state snoozed or
    /// retry-scheduled executions return to).
    Pending,
    Running,
    Completed,
    Failed,
    /// Skipped on a tool's explicit `Cancel` control error.
    Skipped,
}

impl ToolExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation produced by an iteration's tool_use block.
///
/// Agent-as-tool executions reference (never own) a child run in the same
/// session; the child run's terminal state drives this execution's terminal
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_id: Uuid,
    pub state: ToolExecutionState,
    /// The model-assigned tool_use id that the eventual tool_result block
    /// must reference.
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub is_agent_tool: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Advanced only on ordinary (non-snooze) failures.
    #[serde(default)]
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Executions are not claimable before this instant (snooze/retry).
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by_instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolExecution {
    pub fn new(
        run_id: Uuid,
        iteration_id: Uuid,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            iteration_id,
            state: ToolExecutionState::Pending,
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            is_agent_tool: false,
            agent_id: None,
            child_run_id: None,
            tool_output: None,
            is_error: false,
            error_message: None,
            attempt_count: 0,
            max_attempts,
            scheduled_at: now,
            claimed_by_instance_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Mark this execution as delegating to an agent.
    pub fn as_agent_tool(mut self, agent_id: Uuid) -> Self {
        self.is_agent_tool = true;
        self.agent_id = Some(agent_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set() {
        assert!(!ToolExecutionState::Pending.is_terminal());
        assert!(!ToolExecutionState::Running.is_terminal());
        assert!(ToolExecutionState::Completed.is_terminal());
        assert!(ToolExecutionState::Failed.is_terminal());
        assert!(ToolExecutionState::Skipped.is_terminal());
    }

    #[test]
    fn agent_tool_builder() {
        let agent = Uuid::new_v4();
        let te = ToolExecution::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "toolu_9",
            "researcher",
            serde_json::json!({"prompt": "dig"}),
            3,
        )
        .as_agent_tool(agent);
        assert!(te.is_agent_tool);
        assert_eq!(te.agent_id, Some(agent));
        assert_eq!(te.attempt_count, 0);
        assert!(te.scheduled_at <= Utc::now());
    }
}
