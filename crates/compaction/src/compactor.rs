//! The compactor — owns the session-rewrite protocol.

use std::sync::Arc;
use std::time::Instant;

use am_domain::compaction::CompactionEvent;
use am_domain::config::CompactionConfig;
use am_domain::message::Message;
use am_domain::{Error, Result};
use am_model::ModelClient;
use am_store::{ApplyCompaction, Store};
use chrono::Utc;
use uuid::Uuid;

use crate::partition::partition;
use crate::strategy;
use crate::summarizer::Summarizer;
use crate::token_counter::TokenCounter;

/// Outcome of one `compact` call.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub event: CompactionEvent,
    pub summary_created: bool,
    pub tokens_removed: u64,
}

pub struct Compactor {
    store: Arc<dyn Store>,
    counter: TokenCounter,
    summarizer: Summarizer,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(store: Arc<dyn Store>, model_client: Arc<dyn ModelClient>, config: CompactionConfig) -> Self {
        let counter = TokenCounter::new(
            model_client.clone(),
            config.summarizer_model.clone(),
            config.use_token_counting_api,
        );
        let summarizer = Summarizer::new(
            model_client,
            config.summarizer_model.clone(),
            config.summarizer_max_tokens,
        );
        Self {
            store,
            counter,
            summarizer,
            config,
        }
    }

    /// Compact unconditionally. `Err(NoMessagesToCompact)` when the
    /// partition has nothing eligible.
    pub async fn compact(&self, session_id: Uuid) -> Result<CompactionResult> {
        let started = Instant::now();
        let messages = self.store.get_messages(session_id).await?;
        let parts = partition(&messages, &self.counter, &self.config).await;
        if parts.compactable.is_empty() {
            return Err(Error::NoMessagesToCompact);
        }
        let original_tokens = parts.stats.total_tokens;

        let outcome = strategy::execute(&parts, &self.counter, &self.summarizer, &self.config).await?;

        // Token accounting for the audit record.
        let mut removed_tokens = 0u64;
        for message in &outcome.archived {
            removed_tokens += self.counter.count_message(message).await;
        }
        for rewrite in &outcome.rewrites {
            let original = messages.iter().find(|m| m.id == rewrite.id);
            if let Some(original) = original {
                let before = self.counter.count_message(original).await;
                let after = self.counter.count_message(rewrite).await;
                removed_tokens += before.saturating_sub(after);
            }
        }
        let summary_tokens = match &outcome.summary_text {
            Some(text) => self.counter.count_text(text).await,
            None => 0,
        };
        let compacted_tokens = original_tokens - removed_tokens + summary_tokens;

        let archive_message_ids: Vec<Uuid> = outcome.archived.iter().map(|m| m.id).collect();
        let preserved_message_ids: Vec<Uuid> = messages
            .iter()
            .map(|m| m.id)
            .filter(|id| !archive_message_ids.contains(id))
            .collect();

        let summary_message = outcome.summary_text.as_ref().map(|text| {
            let mut summary = Message::assistant_text(session_id, text.clone());
            summary.is_summary = true;
            // Date the summary where the removed span began so chronological
            // reads place it ahead of everything kept.
            if let Some(first) = outcome.archived.first() {
                summary.created_at = first.created_at;
            }
            summary
        });

        let event = CompactionEvent {
            id: Uuid::new_v4(),
            session_id,
            strategy: self.config.strategy.as_str().to_string(),
            original_tokens,
            compacted_tokens,
            messages_removed: outcome.archived.len() as u32,
            summary_content: outcome.summary_text.clone(),
            preserved_message_ids,
            model_used: outcome
                .summary_text
                .is_some()
                .then(|| self.summarizer.model().to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        let summary_created = summary_message.is_some();

        self.store
            .apply_compaction(ApplyCompaction {
                session_id,
                event: event.clone(),
                archive_message_ids,
                rewrite_messages: outcome.rewrites,
                summary_message,
            })
            .await?;

        tracing::info!(
            %session_id,
            strategy = %event.strategy,
            original_tokens,
            compacted_tokens,
            messages_removed = event.messages_removed,
            summary_created,
            "session compacted"
        );

        Ok(CompactionResult {
            event,
            summary_created,
            tokens_removed: removed_tokens,
        })
    }

    /// Compact only when the session crossed `trigger * max_tokens_for_model`.
    /// `Ok(None)` below threshold, and also when there is nothing to
    /// compact (benign).
    pub async fn compact_if_needed(&self, session_id: Uuid) -> Result<Option<CompactionResult>> {
        let messages = self.store.get_messages(session_id).await?;
        let total = self.counter.count_messages(&messages).await;
        let threshold = (self.config.trigger * self.config.max_tokens_for_model as f64) as u64;
        if total < threshold {
            return Ok(None);
        }
        tracing::debug!(%session_id, total, threshold, "compaction threshold crossed");
        match self.compact(session_id).await {
            Ok(result) => Ok(Some(result)),
            Err(Error::NoMessagesToCompact) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_domain::config::CompactionStrategy;
    use am_domain::message::ContentBlock;
    use am_domain::message::Role;
    use am_domain::session::Session;
    use am_model::mock::MockModelClient;
    use am_store::MemoryStore;

    async fn seeded_session(store: &MemoryStore) -> Session {
        let session = Session::new("t1", "s1");
        store.create_session(&session).await.unwrap();
        session
    }

    fn compactor(store: Arc<MemoryStore>, client: Arc<MockModelClient>, config: CompactionConfig) -> Compactor {
        Compactor::new(store, client, config)
    }

    #[tokio::test]
    async fn below_threshold_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockModelClient::new());
        let session = seeded_session(&store).await;
        store
            .append_message(&Message::user_text(session.id, "short"))
            .await
            .unwrap();

        let config = CompactionConfig {
            use_token_counting_api: false,
            ..Default::default()
        };
        let result = compactor(store, client, config)
            .compact_if_needed(session.id)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn hybrid_prune_only_writes_event_without_summary() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockModelClient::new());
        let session = seeded_session(&store).await;

        let mut call = Message::assistant_text(session.id, "gathering");
        for i in 0..5 {
            call.blocks.push(ContentBlock::tool_use(
                format!("t{i}"),
                "fetch",
                serde_json::json!({}),
            ));
        }
        store.append_message(&call).await.unwrap();
        for i in 0..5 {
            store
                .append_message(&Message::new(
                    session.id,
                    Role::User,
                    vec![ContentBlock::tool_result(format!("t{i}"), "z".repeat(40_000), false)],
                ))
                .await
                .unwrap();
        }
        store
            .append_message(&Message::user_text(session.id, "latest question"))
            .await
            .unwrap();

        let config = CompactionConfig {
            strategy: CompactionStrategy::Hybrid,
            trigger: 0.5,
            target_tokens: 80_000,
            max_tokens_for_model: 100_000,
            protected_tokens: 100,
            preserve_last_n: 0,
            use_token_counting_api: false,
            ..Default::default()
        };
        let result = compactor(store.clone(), client.clone(), config)
            .compact_if_needed(session.id)
            .await
            .unwrap()
            .expect("threshold crossed");

        assert!(!result.summary_created);
        assert_eq!(result.event.messages_removed, 0);
        assert!(result.event.compacted_tokens <= 80_000);
        // No summarizer call was made.
        assert!(client.requests().is_empty());

        // Tool outputs rewrote to the sentinel.
        let messages = store.get_messages(session.id).await.unwrap();
        let pruned = messages
            .iter()
            .flat_map(|m| &m.blocks)
            .filter(|b| matches!(b, ContentBlock::ToolResult { content, .. } if content == crate::TOOL_OUTPUT_PRUNED))
            .count();
        assert_eq!(pruned, 5);

        // One audit event, message count unchanged.
        assert_eq!(store.list_compaction_events(session.id).await.unwrap().len(), 1);
        assert_eq!(messages.len(), 7);
    }

    #[tokio::test]
    async fn summarization_replaces_history_with_summary() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockModelClient::new());
        client.push_text("nine section summary");
        let session = seeded_session(&store).await;

        let mut old_ids = Vec::new();
        for i in 0..6 {
            let m = Message::user_text(session.id, format!("{i} {}", "q".repeat(400)));
            old_ids.push(m.id);
            store.append_message(&m).await.unwrap();
        }
        let tail = Message::user_text(session.id, "tail");
        store.append_message(&tail).await.unwrap();

        let config = CompactionConfig {
            strategy: CompactionStrategy::Summarization,
            protected_tokens: 10,
            preserve_last_n: 0,
            use_token_counting_api: false,
            ..Default::default()
        };
        let result = compactor(store.clone(), client, config)
            .compact(session.id)
            .await
            .unwrap();

        assert!(result.summary_created);
        assert_eq!(result.event.messages_removed, 6);
        assert!(result.event.compacted_tokens < result.event.original_tokens);

        let messages = store.get_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_summary);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[1].id, tail.id);

        // Archive union survivors equals original set.
        let archived = store.list_archived_messages(result.event.id).await.unwrap();
        let mut union: Vec<Uuid> = archived.iter().map(|a| a.message_id).collect();
        union.extend(result.event.preserved_message_ids.iter().copied());
        union.sort();
        let mut original = old_ids.clone();
        original.push(tail.id);
        original.sort();
        assert_eq!(union, original);
    }

    #[tokio::test]
    async fn empty_session_reports_nothing_to_compact() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockModelClient::new());
        let session = seeded_session(&store).await;
        let config = CompactionConfig {
            use_token_counting_api: false,
            ..Default::default()
        };
        let err = compactor(store, client, config).compact(session.id).await.unwrap_err();
        assert!(matches!(err, Error::NoMessagesToCompact));
    }
}
