//! The tool seam: what tool implementations provide, and the control-flow
//! errors they may return to steer retry/snooze/skip handling.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-Schema-shaped description of a tool's input object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "d_object")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    #[serde(rename = "type")]
    pub prop_type: String,
    #[serde(default)]
    pub description: String,
}

fn d_object() -> String {
    "object".into()
}

impl InputSchema {
    /// An empty object schema (tools that take no arguments).
    pub fn empty() -> Self {
        Self {
            schema_type: "object".into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn with_property(
        mut self,
        name: impl Into<String>,
        prop_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(
            name.clone(),
            PropertySpec {
                prop_type: prop_type.into(),
                description: description.into(),
            },
        );
        if required {
            self.required.push(name);
        }
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool control-flow errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors a tool may return. These are control flow, not failures of the
/// engine: each variant maps to a distinct scheduling outcome.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    /// Abort immediately; the execution moves to `skipped`. No retry.
    #[error("cancelled: {0}")]
    Cancel(String),

    /// Permanently invalid input; the execution moves to `failed`. No retry.
    #[error("discarded: {0}")]
    Discard(String),

    /// Re-schedule after the given delay without counting an attempt.
    #[error("snoozed for {0:?}")]
    Snooze(Duration),

    /// Ordinary failure; retried with backoff until `max_attempts`.
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn discard(msg: impl Into<String>) -> Self {
        Self::Discard(msg.into())
    }

    pub fn cancel(msg: impl Into<String>) -> Self {
        Self::Cancel(msg.into())
    }
}

pub type ToolResult = std::result::Result<String, ToolError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every tool implementation provides.
///
/// `execute` receives the engine's cancellation token; implementations
/// doing long work should observe it (the ToolWorker also enforces a hard
/// timeout around the whole call).
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> InputSchema;

    async fn execute(&self, cancel: &CancellationToken, input: serde_json::Value) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_builder() {
        let schema = InputSchema::empty().with_property("location", "string", "City name", true);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["type"], "object");
        assert_eq!(json["properties"]["location"]["type"], "string");
        assert_eq!(json["required"][0], "location");
    }

    #[test]
    fn error_display() {
        assert_eq!(ToolError::failed("boom").to_string(), "boom");
        assert!(ToolError::cancel("user said stop").to_string().starts_with("cancelled"));
        assert!(ToolError::Snooze(Duration::from_millis(200)).to_string().contains("200ms"));
    }
}
