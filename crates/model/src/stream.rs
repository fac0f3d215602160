//! Streaming events and the accumulator that folds them into a final
//! [`ModelResponse`].

use am_domain::message::{ContentBlock, TokenUsage};
use am_domain::{Error, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::types::ModelResponse;
use crate::BoxStream;

/// Events emitted during a streaming model call (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text token chunk.
    TextDelta { text: String },

    /// Reasoning content from the model.
    ThinkingDelta { text: String },

    /// A tool_use block has opened.
    ToolUseStarted { id: String, name: String },

    /// Incremental tool input JSON.
    ToolUseDelta { id: String, partial_json: String },

    /// The stream finished.
    Done {
        stop_reason: Option<String>,
        usage: TokenUsage,
    },

    /// The provider reported an error mid-stream.
    Error { message: String },
}

/// A boxed stream of model events.
pub type ModelStream = BoxStream<'static, Result<StreamEvent>>;

/// Fold a [`ModelStream`] into the final [`ModelResponse`].
///
/// Text deltas concatenate into one text block; thinking deltas into one
/// thinking block; tool_use deltas assemble per-id and are emitted in the
/// order the blocks opened. A mid-stream `Error` event aborts with
/// [`Error::Model`].
pub async fn accumulate(mut stream: ModelStream) -> Result<ModelResponse> {
    let mut text_buf = String::new();
    let mut thinking_buf = String::new();
    // (id, name, partial input json), in open order.
    let mut tool_bufs: Vec<(String, String, String)> = Vec::new();
    let mut stop_reason = None;
    let mut usage = TokenUsage::default();

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text } => text_buf.push_str(&text),
            StreamEvent::ThinkingDelta { text } => thinking_buf.push_str(&text),
            StreamEvent::ToolUseStarted { id, name } => {
                tool_bufs.push((id, name, String::new()));
            }
            StreamEvent::ToolUseDelta { id, partial_json } => {
                if let Some((_, _, buf)) = tool_bufs.iter_mut().find(|(bid, _, _)| *bid == id) {
                    buf.push_str(&partial_json);
                }
            }
            StreamEvent::Done {
                stop_reason: reason,
                usage: u,
            } => {
                stop_reason = reason;
                usage = u;
            }
            StreamEvent::Error { message } => return Err(Error::Model(message)),
        }
    }

    let mut content = Vec::new();
    if !thinking_buf.is_empty() {
        content.push(ContentBlock::Thinking { text: thinking_buf });
    }
    if !text_buf.is_empty() {
        content.push(ContentBlock::text(text_buf));
    }
    for (id, name, input_json) in tool_bufs {
        let input = if input_json.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&input_json)
                .map_err(|e| Error::Model(format!("tool input for {id} is not valid JSON: {e}")))?
        };
        content.push(ContentBlock::tool_use(id, name, input));
    }

    Ok(ModelResponse {
        content,
        stop_reason,
        usage,
        model: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(events: Vec<StreamEvent>) -> ModelStream {
        Box::pin(futures_util::stream::iter(events.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn accumulates_text_and_tools() {
        let events = vec![
            StreamEvent::TextDelta { text: "let me ".into() },
            StreamEvent::TextDelta { text: "check".into() },
            StreamEvent::ToolUseStarted {
                id: "t1".into(),
                name: "get_weather".into(),
            },
            StreamEvent::ToolUseDelta {
                id: "t1".into(),
                partial_json: "{\"location\":".into(),
            },
            StreamEvent::ToolUseDelta {
                id: "t1".into(),
                partial_json: "\"Tokyo\"}".into(),
            },
            StreamEvent::Done {
                stop_reason: Some("tool_use".into()),
                usage: TokenUsage {
                    input_tokens: 12,
                    output_tokens: 7,
                    ..Default::default()
                },
            },
        ];
        let resp = accumulate(stream_of(events)).await.unwrap();
        assert_eq!(resp.text(), "let me check");
        assert!(resp.has_tool_use());
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(resp.usage.output_tokens, 7);
        match &resp.content[1] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["location"], "Tokyo"),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_tool_input_defaults_to_object() {
        let events = vec![
            StreamEvent::ToolUseStarted {
                id: "t1".into(),
                name: "ping".into(),
            },
            StreamEvent::Done {
                stop_reason: Some("tool_use".into()),
                usage: TokenUsage::default(),
            },
        ];
        let resp = accumulate(stream_of(events)).await.unwrap();
        match &resp.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert!(input.as_object().unwrap().is_empty())
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mid_stream_error_aborts() {
        let events = vec![
            StreamEvent::TextDelta { text: "par".into() },
            StreamEvent::Error {
                message: "overloaded".into(),
            },
        ];
        let err = accumulate(stream_of(events)).await.unwrap_err();
        assert!(matches!(err, Error::Model(_)));
    }
}
