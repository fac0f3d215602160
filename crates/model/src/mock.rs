//! A scripted [`ModelClient`] for tests and embedded development.
//!
//! Responses are queued with `push_*` and consumed in order by streaming
//! calls and batch submissions alike. Every request is recorded for
//! assertions. Batches stay `in_progress` for a configurable number of
//! polls before ending.

use std::collections::{HashMap, VecDeque};

use am_domain::iteration::BatchStatus;
use am_domain::message::{ContentBlock, TokenUsage};
use am_domain::{Error, Result};
use parking_lot::Mutex;

use crate::stream::{ModelStream, StreamEvent};
use crate::types::{
    BatchHandle, BatchItemResult, BatchRequestItem, BatchResultItem, ModelMessage, ModelRequest,
    ModelResponse,
};
use crate::{BoxStream, ModelClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
enum Scripted {
    Response(ModelResponse),
    Error(String),
}

struct MockBatch {
    polls_remaining: u32,
    results: Vec<BatchResultItem>,
}

struct Inner {
    script: VecDeque<Scripted>,
    requests: Vec<ModelRequest>,
    batches: HashMap<String, MockBatch>,
    fail_token_counts: bool,
    batch_polls_before_done: u32,
    next_batch_seq: u64,
}

/// Scripted model client. Cheap to clone via `Arc` at call sites.
pub struct MockModelClient {
    inner: Mutex<Inner>,
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                script: VecDeque::new(),
                requests: Vec::new(),
                batches: HashMap::new(),
                fail_token_counts: false,
                batch_polls_before_done: 1,
                next_batch_seq: 0,
            }),
        }
    }

    /// Queue a plain-text `end_turn` response.
    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: approx_tokens(&text),
            ..Default::default()
        };
        self.push_response(ModelResponse {
            content: vec![ContentBlock::text(text)],
            stop_reason: Some("end_turn".into()),
            usage,
            model: "mock".into(),
        });
    }

    /// Queue a response carrying one tool_use block (plus optional lead-in
    /// text).
    pub fn push_tool_use(
        &self,
        text: Option<&str>,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) {
        let mut content = Vec::new();
        if let Some(t) = text {
            content.push(ContentBlock::text(t));
        }
        content.push(ContentBlock::tool_use(tool_use_id, tool_name, input));
        self.push_response(ModelResponse {
            content,
            stop_reason: Some("tool_use".into()),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            model: "mock".into(),
        });
    }

    /// Queue an empty-content response (`stop_reason: end_turn`, no
    /// blocks), which drives the `empty_response` failure path.
    pub fn push_empty(&self) {
        self.push_response(ModelResponse {
            content: vec![],
            stop_reason: Some("end_turn".into()),
            usage: TokenUsage::default(),
            model: "mock".into(),
        });
    }

    pub fn push_response(&self, response: ModelResponse) {
        self.inner.lock().script.push_back(Scripted::Response(response));
    }

    /// Queue a mid-stream error.
    pub fn push_error(&self, message: impl Into<String>) {
        self.inner.lock().script.push_back(Scripted::Error(message.into()));
    }

    /// Make `count_tokens` fail from now on (drives the counter's
    /// permanent fallback switch).
    pub fn fail_token_counts(&self) {
        self.inner.lock().fail_token_counts = true;
    }

    /// How many `get_batch` polls report `in_progress` before `ended`.
    pub fn set_batch_polls_before_done(&self, polls: u32) {
        self.inner.lock().batch_polls_before_done = polls;
    }

    /// All requests observed so far (streaming and batch alike).
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.inner.lock().requests.clone()
    }

    fn next_scripted(&self, req: &ModelRequest) -> Scripted {
        let mut inner = self.inner.lock();
        inner.requests.push(req.clone());
        inner.script.pop_front().unwrap_or_else(|| {
            // Unscripted calls echo deterministically instead of panicking
            // so long test scenarios don't have to script every summary.
            Scripted::Response(ModelResponse {
                content: vec![ContentBlock::text("ok")],
                stop_reason: Some("end_turn".into()),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 1,
                    ..Default::default()
                },
                model: "mock".into(),
            })
        })
    }
}

fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// Expand a response into the event sequence a streaming call would emit.
fn response_to_events(resp: &ModelResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for block in &resp.content {
        match block {
            ContentBlock::Text { text } => {
                // Split into two deltas so accumulation is exercised.
                let mid = text.len() / 2;
                let (a, b) = text.split_at(mid);
                if !a.is_empty() {
                    events.push(StreamEvent::TextDelta { text: a.to_string() });
                }
                events.push(StreamEvent::TextDelta { text: b.to_string() });
            }
            ContentBlock::Thinking { text } => {
                events.push(StreamEvent::ThinkingDelta { text: text.clone() });
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ToolUseStarted {
                    id: id.clone(),
                    name: name.clone(),
                });
                events.push(StreamEvent::ToolUseDelta {
                    id: id.clone(),
                    partial_json: input.to_string(),
                });
            }
            other => {
                tracing::debug!(?other, "mock stream skipping non-streamable block");
            }
        }
    }
    events.push(StreamEvent::Done {
        stop_reason: resp.stop_reason.clone(),
        usage: resp.usage,
    });
    events
}

#[async_trait::async_trait]
impl ModelClient for MockModelClient {
    async fn count_tokens(&self, _model: &str, messages: &[ModelMessage]) -> Result<u64> {
        if self.inner.lock().fail_token_counts {
            return Err(Error::TokenCountingFailed("mock: counting disabled".into()));
        }
        let mut total = 0u64;
        for msg in messages {
            total += 4;
            for block in &msg.blocks {
                total += match block {
                    ContentBlock::Text { text } | ContentBlock::Thinking { text } => approx_tokens(text),
                    ContentBlock::ToolUse { input, .. } => 10 + approx_tokens(&input.to_string()),
                    ContentBlock::ToolResult { content, .. } => 10 + approx_tokens(content),
                    ContentBlock::Image { .. } | ContentBlock::Document { .. } => 200,
                    ContentBlock::WebSearchResult { content, .. } => approx_tokens(content),
                };
            }
        }
        Ok(total)
    }

    async fn stream(&self, req: ModelRequest) -> Result<ModelStream> {
        let scripted = self.next_scripted(&req);
        let events: Vec<Result<StreamEvent>> = match scripted {
            Scripted::Response(resp) => response_to_events(&resp).into_iter().map(Ok).collect(),
            Scripted::Error(message) => vec![Ok(StreamEvent::Error { message })],
        };
        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    async fn submit_batch(&self, requests: Vec<BatchRequestItem>) -> Result<BatchHandle> {
        // Resolve results at submission time so the script order matches
        // submission order regardless of poll timing.
        let mut results = Vec::with_capacity(requests.len());
        for item in &requests {
            let result = match self.next_scripted(&item.request) {
                Scripted::Response(resp) => BatchItemResult::Succeeded { response: resp },
                Scripted::Error(message) => BatchItemResult::Errored { message },
            };
            results.push(BatchResultItem {
                custom_id: item.custom_id.clone(),
                result,
            });
        }

        let mut inner = self.inner.lock();
        inner.next_batch_seq += 1;
        let id = format!("mockbatch_{}", inner.next_batch_seq);
        let polls = inner.batch_polls_before_done;
        inner.batches.insert(
            id.clone(),
            MockBatch {
                polls_remaining: polls,
                results,
            },
        );
        Ok(BatchHandle {
            id,
            status: BatchStatus::InProgress,
        })
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchHandle> {
        let mut inner = self.inner.lock();
        let batch = inner.batches.get_mut(batch_id).ok_or(Error::NotFound {
            entity: "batch",
            id: batch_id.to_string(),
        })?;
        let status = if batch.polls_remaining == 0 {
            BatchStatus::Ended
        } else {
            batch.polls_remaining -= 1;
            if batch.polls_remaining == 0 {
                BatchStatus::Ended
            } else {
                BatchStatus::InProgress
            }
        };
        Ok(BatchHandle {
            id: batch_id.to_string(),
            status,
        })
    }

    async fn batch_results(&self, batch_id: &str) -> Result<BoxStream<'static, Result<BatchResultItem>>> {
        let inner = self.inner.lock();
        let batch = inner.batches.get(batch_id).ok_or(Error::NotFound {
            entity: "batch",
            id: batch_id.to_string(),
        })?;
        if batch.polls_remaining > 0 {
            return Err(Error::BatchError(format!("batch {batch_id} has not ended")));
        }
        let items: Vec<Result<BatchResultItem>> = batch.results.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::accumulate;

    #[tokio::test]
    async fn scripted_stream_round_trip() {
        let client = MockModelClient::new();
        client.push_tool_use(Some("checking"), "t1", "get_weather", serde_json::json!({"location": "Tokyo"}));

        let stream = client
            .stream(ModelRequest {
                model: "mock".into(),
                max_tokens: 64,
                messages: vec![ModelMessage::user_text("weather in Tokyo?")],
                ..Default::default()
            })
            .await
            .unwrap();
        let resp = accumulate(stream).await.unwrap();
        assert!(resp.has_tool_use());
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn batch_lifecycle() {
        let client = MockModelClient::new();
        client.push_text("hello from batch");
        client.set_batch_polls_before_done(2);

        let handle = client
            .submit_batch(vec![BatchRequestItem {
                custom_id: "iter-1".into(),
                request: ModelRequest::default(),
            }])
            .await
            .unwrap();
        assert!(matches!(handle.status, BatchStatus::InProgress));

        // First poll still in progress, second ends.
        assert!(matches!(client.get_batch(&handle.id).await.unwrap().status, BatchStatus::InProgress));
        assert!(matches!(client.get_batch(&handle.id).await.unwrap().status, BatchStatus::Ended));

        let mut results = Vec::new();
        let mut stream = client.batch_results(&handle.id).await.unwrap();
        use futures_util::StreamExt;
        while let Some(item) = stream.next().await {
            results.push(item.unwrap());
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].custom_id, "iter-1");
        match &results[0].result {
            BatchItemResult::Succeeded { response } => {
                assert_eq!(response.text(), "hello from batch")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_count_failure_flag() {
        let client = MockModelClient::new();
        let msgs = vec![ModelMessage::user_text("hello")];
        assert!(client.count_tokens("mock", &msgs).await.is_ok());
        client.fail_token_counts();
        assert!(matches!(
            client.count_tokens("mock", &msgs).await,
            Err(Error::TokenCountingFailed(_))
        ));
    }
}
