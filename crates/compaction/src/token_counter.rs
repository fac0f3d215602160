//! Token counting with an API-first path and a character-approximation
//! fallback.
//!
//! A failed API call flips the counter into fallback mode for the rest of
//! its lifetime; callers never see the failure because the approximation
//! always succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use am_domain::message::{ContentBlock, Message};
use am_model::{ModelClient, ModelMessage};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Fixed per-message envelope overhead in the approximation.
const MESSAGE_OVERHEAD: u64 = 4;
/// Structural envelope of a tool_use / tool_result block.
const TOOL_ENVELOPE_OVERHEAD: u64 = 10;
/// Flat estimate for image and document blocks.
const MEDIA_TOKENS: u64 = 200;

type CacheKey = (String, [u8; 32]);

pub struct TokenCounter {
    client: Arc<dyn ModelClient>,
    model: String,
    use_api: bool,
    /// Set once on the first API failure; never cleared.
    fallback_only: AtomicBool,
    cache: Mutex<HashMap<CacheKey, u64>>,
}

impl TokenCounter {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>, use_api: bool) -> Self {
        Self {
            client,
            model: model.into(),
            use_api,
            fallback_only: AtomicBool::new(false),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Count one message. Infallible: the approximation covers API
    /// failures.
    pub async fn count_message(&self, message: &Message) -> u64 {
        let key = self.cache_key_message(message);
        if let Some(count) = self.cache.lock().get(&key) {
            return *count;
        }

        let count = if self.api_enabled() {
            let model_message = ModelMessage::from(message);
            match self
                .client
                .count_tokens(&self.model, std::slice::from_ref(&model_message))
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(error = %e, "token count API failed, switching to approximation");
                    self.fallback_only.store(true, Ordering::Release);
                    approximate_message(message)
                }
            }
        } else {
            approximate_message(message)
        };

        self.cache.lock().insert(key, count);
        count
    }

    /// Sum over a message list.
    pub async fn count_messages(&self, messages: &[Message]) -> u64 {
        let mut total = 0;
        for message in messages {
            total += self.count_message(message).await;
        }
        total
    }

    /// Count a plain string.
    pub async fn count_text(&self, text: &str) -> u64 {
        let key = (self.model.clone(), content_hash(text.as_bytes()));
        if let Some(count) = self.cache.lock().get(&key) {
            return *count;
        }
        let count = if self.api_enabled() {
            match self.client.count_tokens(&self.model, &[ModelMessage::user_text(text)]).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(error = %e, "token count API failed, switching to approximation");
                    self.fallback_only.store(true, Ordering::Release);
                    approximate_text(text)
                }
            }
        } else {
            approximate_text(text)
        };
        self.cache.lock().insert(key, count);
        count
    }

    fn api_enabled(&self) -> bool {
        self.use_api && !self.fallback_only.load(Ordering::Acquire)
    }

    fn cache_key_message(&self, message: &Message) -> CacheKey {
        let serialized = serde_json::to_vec(&message.blocks).unwrap_or_default();
        (self.model.clone(), content_hash(&serialized))
    }
}

fn content_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn approximate_text(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// ceil(chars/4) per text plus fixed structural overheads.
pub(crate) fn approximate_message(message: &Message) -> u64 {
    let mut total = MESSAGE_OVERHEAD;
    for block in &message.blocks {
        total += match block {
            ContentBlock::Text { text } | ContentBlock::Thinking { text } => approximate_text(text),
            ContentBlock::ToolUse { input, .. } => {
                TOOL_ENVELOPE_OVERHEAD + approximate_text(&input.to_string())
            }
            ContentBlock::ToolResult { content, .. } => {
                TOOL_ENVELOPE_OVERHEAD + approximate_text(content)
            }
            ContentBlock::Image { .. } | ContentBlock::Document { .. } => MEDIA_TOKENS,
            ContentBlock::WebSearchResult { content, .. } => approximate_text(content),
        };
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_model::mock::MockModelClient;
    use uuid::Uuid;

    fn text_message(text: &str) -> Message {
        Message::user_text(Uuid::new_v4(), text)
    }

    #[tokio::test]
    async fn approximation_when_api_disabled() {
        let client = Arc::new(MockModelClient::new());
        let counter = TokenCounter::new(client, "mock", false);
        // 8 chars -> 2 tokens + 4 overhead
        assert_eq!(counter.count_message(&text_message("12345678")).await, 6);
        assert_eq!(counter.count_text("12345678").await, 2);
    }

    #[tokio::test]
    async fn api_failure_switches_permanently() {
        let client = Arc::new(MockModelClient::new());
        client.fail_token_counts();
        let counter = TokenCounter::new(client.clone(), "mock", true);

        // First call hits the API, fails, and falls back.
        assert_eq!(counter.count_message(&text_message("12345678")).await, 6);
        // Counter no longer consults the API even for new content.
        let before = client.requests().len();
        counter.count_message(&text_message("other content")).await;
        assert_eq!(client.requests().len(), before);
    }

    #[tokio::test]
    async fn cache_prevents_recount() {
        let client = Arc::new(MockModelClient::new());
        let counter = TokenCounter::new(client, "mock", false);
        let msg = text_message("cache me");
        let first = counter.count_message(&msg).await;
        // Identical content hits the memo even via a distinct Message id.
        let again = text_message("cache me");
        assert_eq!(counter.count_message(&again).await, first);
    }

    #[tokio::test]
    async fn media_blocks_use_flat_estimate() {
        let mut msg = text_message("x");
        msg.blocks.push(ContentBlock::Image {
            media_type: "image/png".into(),
            data: "aGk=".into(),
        });
        let client = Arc::new(MockModelClient::new());
        let counter = TokenCounter::new(client, "mock", false);
        // 4 overhead + 1 text + 200 media
        assert_eq!(counter.count_message(&msg).await, 205);
    }
}
