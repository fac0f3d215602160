//! Agent and tool catalog records — the durable side of the process-local
//! registry. Instances heartbeat their capability sets against these rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named agent: a system prompt, a model, and the tools it may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: Uuid,
    /// Unique name; `Client::run` resolves agents by name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub model: String,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    /// Names of tools this agent may call (including other agents exposed
    /// as tools).
    #[serde(default)]
    pub tool_names: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentDefinition {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            max_output_tokens,
            tool_names: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Catalog row for a registered tool implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
