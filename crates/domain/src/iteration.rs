use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::TokenUsage;

/// What caused a model call: the initial user prompt, or gathered tool
/// results from the previous iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    UserPrompt,
    ToolResults,
}

/// Provider-agnostic lifecycle of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Ended,
    Canceling,
    Errored,
}

/// One model call within a run. `(run_id, iteration_number)` is unique,
/// numbers are 1-based and increment by exactly one, and at most one
/// iteration per run is open (no `completed_at`) at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_number: u32,
    pub is_streaming: bool,
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<BatchStatus>,
    #[serde(default)]
    pub batch_poll_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub has_tool_use: bool,
    #[serde(default)]
    pub tool_execution_count: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Iteration {
    pub fn new(run_id: Uuid, iteration_number: u32, is_streaming: bool, trigger_type: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            iteration_number,
            is_streaming,
            trigger_type,
            batch_id: None,
            batch_status: None,
            batch_poll_count: 0,
            stop_reason: None,
            has_tool_use: false,
            tool_execution_count: 0,
            usage: TokenUsage::default(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_iteration_is_open() {
        let it = Iteration::new(Uuid::new_v4(), 1, true, TriggerType::UserPrompt);
        assert!(it.is_open());
        assert_eq!(it.iteration_number, 1);
        assert_eq!(it.batch_poll_count, 0);
    }

    #[test]
    fn trigger_serde() {
        assert_eq!(
            serde_json::to_string(&TriggerType::ToolResults).unwrap(),
            "\"tool_results\""
        );
    }
}
