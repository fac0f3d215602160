//! Typed JSON payloads for the structured notification channels. Channels
//! not listed here carry a bare id string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of [`crate::channels::RUN_CREATED`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreated {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

/// Payload of [`crate::channels::TOOL_PENDING`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPending {
    pub tool_execution_id: Uuid,
    pub run_id: Uuid,
    pub tool_name: String,
}

/// Payload of [`crate::channels::RUN_TOOLS_COMPLETE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunToolsComplete {
    pub run_id: Uuid,
    pub completed_count: u32,
    pub failed_count: u32,
}
