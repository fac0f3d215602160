//! Messages and content blocks — the persisted conversation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Token usage for one model call, accumulated onto messages and runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered child of a [`Message`]. The serde form is the wire form stored in
/// the content_blocks table and sent to the model adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        /// The model-assigned id that later tool_result blocks reference.
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    Document {
        media_type: String,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    WebSearchResult {
        url: String,
        title: String,
        #[serde(default)]
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub role: Role,
    /// Ordered blocks; Vec order is the persisted block_index order.
    pub blocks: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Preserved messages are never compacted away.
    #[serde(default)]
    pub is_preserved: bool,
    /// Summary messages produced by the compactor.
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: Uuid, role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            run_id: None,
            role,
            blocks,
            usage: TokenUsage::default(),
            is_preserved: false,
            is_summary: false,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn user_text(session_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant_text(session_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_result)
    }

    /// True when the last block is a `tool_use`; the partitioner must not
    /// place a compaction boundary immediately after such a message.
    pub fn ends_with_tool_use(&self) -> bool {
        matches!(self.blocks.last(), Some(ContentBlock::ToolUse { .. }))
    }

    /// True when the first block is a `tool_result`; the partitioner must
    /// not place a compaction boundary immediately before such a message.
    pub fn starts_with_tool_result(&self) -> bool {
        matches!(self.blocks.first(), Some(ContentBlock::ToolResult { .. }))
    }

    /// Ids of all tool_use blocks in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of all Text blocks, joined with `"\n"`.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_serde_tagging() {
        let block = ContentBlock::tool_use("toolu_1", "get_weather", serde_json::json!({"location": "Tokyo"}));
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "get_weather");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn boundary_probes() {
        let sid = Uuid::new_v4();
        let mut m = Message::assistant_text(sid, "checking");
        m.blocks.push(ContentBlock::tool_use("t1", "exec", serde_json::json!({})));
        assert!(m.ends_with_tool_use());
        assert!(!m.starts_with_tool_result());

        let r = Message::new(
            sid,
            Role::User,
            vec![ContentBlock::tool_result("t1", "ok", false)],
        );
        assert!(r.starts_with_tool_result());
        assert!(r.has_tool_result());
    }

    #[test]
    fn text_joins_only_text_blocks() {
        let m = Message::new(
            Uuid::new_v4(),
            Role::Assistant,
            vec![
                ContentBlock::text("a"),
                ContentBlock::tool_use("t", "x", serde_json::json!({})),
                ContentBlock::text("b"),
            ],
        );
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            cache_read_tokens: 7,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.cache_read_tokens, 7);
        assert_eq!(total.total(), 18);
    }
}
