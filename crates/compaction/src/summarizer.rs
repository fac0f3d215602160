//! Summarization — renders a message slice as readable text and asks the
//! model for a structured summary.

use std::sync::Arc;

use am_domain::message::{ContentBlock, Message};
use am_domain::{Error, Result};
use am_model::{accumulate, ModelClient, ModelMessage, ModelRequest};

/// Tool results longer than this are abbreviated in the rendered
/// conversation.
const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

const SUMMARY_PROMPT: &str = "You are a conversation summarizer for an agent \
execution engine. Produce a structured summary of the conversation below \
with exactly these nine sections:\n\
1. Conversation Overview\n\
2. Current Goal\n\
3. Key Decisions\n\
4. Tool Activity (tools invoked, inputs, notable outputs)\n\
5. Facts Learned\n\
6. Open Questions\n\
7. User Preferences\n\
8. Pending Work\n\
9. Next Steps\n\n\
Be concise but preserve every actionable detail. Write in present tense. \
Omit greetings and pleasantries.";

pub struct Summarizer {
    client: Arc<dyn ModelClient>,
    model: String,
    max_tokens: u32,
}

impl Summarizer {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Summarize `to_summarize`, with `context` (earlier summaries and
    /// preserved messages) prepended for continuity.
    pub async fn summarize(&self, context: &[Message], to_summarize: &[Message]) -> Result<String> {
        if to_summarize.is_empty() {
            return Err(Error::NoMessagesToCompact);
        }

        let mut prompt = String::from(SUMMARY_PROMPT);
        if !context.is_empty() {
            prompt.push_str("\n\nPRIOR CONTEXT (already summarized or pinned):\n");
            prompt.push_str(&render_messages(context));
        }
        prompt.push_str("\n\nCONVERSATION TO SUMMARIZE:\n");
        prompt.push_str(&render_messages(to_summarize));

        let request = ModelRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: None,
            messages: vec![ModelMessage::user_text(prompt)],
            tools: vec![],
        };

        let stream = self
            .client
            .stream(request)
            .await
            .map_err(|e| Error::SummarizationFailed(e.to_string()))?;
        let response = accumulate(stream)
            .await
            .map_err(|e| Error::SummarizationFailed(e.to_string()))?;

        let text = response.text();
        if text.trim().is_empty() {
            return Err(Error::SummarizationFailed("model produced no summary text".into()));
        }
        Ok(text)
    }
}

/// Human-readable rendering: role label plus concatenated blocks.
fn render_messages(messages: &[Message]) -> String {
    let mut buf = String::new();
    for message in messages {
        let label = match message.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            other => other,
        };
        buf.push_str(label);
        buf.push_str(": ");
        for block in &message.blocks {
            match block {
                ContentBlock::Text { text } => buf.push_str(text),
                ContentBlock::Thinking { .. } => {}
                ContentBlock::ToolUse { name, input, .. } => {
                    buf.push_str(&format!("[Tool: {name}, Input: {input}]"));
                }
                ContentBlock::ToolResult { content, is_error, .. } => {
                    let label = if *is_error { "Tool error" } else { "Tool result" };
                    if content.len() > TOOL_RESULT_PREVIEW_CHARS {
                        let cut = floor_char_boundary(content, TOOL_RESULT_PREVIEW_CHARS);
                        buf.push_str(&format!("[{label}: {}…]", &content[..cut]));
                    } else {
                        buf.push_str(&format!("[{label}: {content}]"));
                    }
                }
                ContentBlock::Image { .. } => buf.push_str("[Image]"),
                ContentBlock::Document { title, .. } => {
                    buf.push_str(&format!("[Document: {}]", title.as_deref().unwrap_or("untitled")));
                }
                ContentBlock::WebSearchResult { url, title, .. } => {
                    buf.push_str(&format!("[Search result: {title} ({url})]"));
                }
            }
            buf.push(' ');
        }
        buf.push('\n');
    }
    buf
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_model::mock::MockModelClient;
    use uuid::Uuid;

    fn summarizer(client: Arc<MockModelClient>) -> Summarizer {
        Summarizer::new(client, "mock-summarizer", 1024)
    }

    #[tokio::test]
    async fn empty_input_is_benign() {
        let client = Arc::new(MockModelClient::new());
        let err = summarizer(client).summarize(&[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::NoMessagesToCompact));
    }

    #[tokio::test]
    async fn renders_tools_and_streams_summary() {
        let client = Arc::new(MockModelClient::new());
        client.push_text("1. Conversation Overview: weather lookup …");

        let session = Uuid::new_v4();
        let mut call = Message::assistant_text(session, "checking");
        call.blocks.push(ContentBlock::tool_use(
            "t1",
            "get_weather",
            serde_json::json!({"location": "Tokyo"}),
        ));
        let result = Message::new(
            session,
            am_domain::message::Role::User,
            vec![ContentBlock::tool_result("t1", &"y".repeat(900), false)],
        );

        let summary = summarizer(client.clone())
            .summarize(&[], &[call, result])
            .await
            .unwrap();
        assert!(summary.starts_with("1. Conversation Overview"));

        // The rendered prompt names the tool and abbreviates the output.
        let request = &client.requests()[0];
        let prompt = match &request.messages[0].blocks[0] {
            ContentBlock::Text { text } => text.clone(),
            other => panic!("unexpected block {other:?}"),
        };
        assert!(prompt.contains("[Tool: get_weather"));
        assert!(prompt.contains('…'));
        assert!(!prompt.contains(&"y".repeat(900)));
    }

    #[tokio::test]
    async fn stream_error_maps_to_summarization_failed() {
        let client = Arc::new(MockModelClient::new());
        client.push_error("overloaded");
        let session = Uuid::new_v4();
        let err = summarizer(client)
            .summarize(&[], &[Message::user_text(session, "hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SummarizationFailed(_)));
    }

    #[tokio::test]
    async fn empty_summary_is_a_failure() {
        let client = Arc::new(MockModelClient::new());
        client.push_empty();
        let session = Uuid::new_v4();
        let err = summarizer(client)
            .summarize(&[], &[Message::user_text(session, "hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SummarizationFailed(_)));
    }
}
