use am_domain::catalog::ToolRecord;
use am_domain::iteration::BatchStatus;
use am_domain::message::{ContentBlock, Message, Role, TokenUsage};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message as sent to the model: role + ordered blocks, stripped of
/// persistence fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl ModelMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::text(text)],
        }
    }
}

impl From<&Message> for ModelMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            blocks: msg.blocks.clone(),
        }
    }
}

/// A tool definition exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

impl From<&ToolRecord> for ToolSpec {
    fn from(rec: &ToolRecord) -> Self {
        Self {
            name: rec.name.clone(),
            description: rec.description.clone(),
            input_schema: rec.input_schema.clone(),
        }
    }
}

/// A provider-agnostic model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ModelMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The accumulated result of one model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub model: String,
}

impl ModelResponse {
    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry in a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestItem {
    /// Caller-supplied correlation id; the engine passes the iteration id.
    pub custom_id: String,
    pub request: ModelRequest,
}

/// Status snapshot of a submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHandle {
    pub id: String,
    pub status: BatchStatus,
}

/// Outcome of a single request within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchItemResult {
    Succeeded { response: ModelResponse },
    Errored { message: String },
    Cancelled,
    Expired,
}

/// One line of a batch result stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultItem {
    pub custom_id: String,
    pub result: BatchItemResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_text_and_tool_use() {
        let resp = ModelResponse {
            content: vec![
                ContentBlock::text("checking the weather"),
                ContentBlock::tool_use("t1", "get_weather", serde_json::json!({"location": "Tokyo"})),
            ],
            stop_reason: Some("tool_use".into()),
            ..Default::default()
        };
        assert!(resp.has_tool_use());
        assert_eq!(resp.text(), "checking the weather");
    }

    #[test]
    fn batch_result_serde() {
        let item = BatchResultItem {
            custom_id: "iter-1".into(),
            result: BatchItemResult::Errored {
                message: "overloaded".into(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["result"]["type"], "errored");
        let back: BatchResultItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.custom_id, "iter-1");
    }
}
