//! Compaction strategies — a tagged variant with one shared execute
//! contract. Two variants: summarize everything compactable, or prune
//! oversized tool outputs first and summarize only if still over target.

use am_domain::config::{CompactionConfig, CompactionStrategy};
use am_domain::message::{ContentBlock, Message};
use am_domain::Result;

use crate::partition::Partition;
use crate::summarizer::Summarizer;
use crate::token_counter::TokenCounter;
use crate::TOOL_OUTPUT_PRUNED;

/// What a strategy decided; the compactor turns this into one atomic
/// store rewrite.
#[derive(Debug, Default)]
pub(crate) struct StrategyOutcome {
    /// Produced summary text, when summarization ran.
    pub summary_text: Option<String>,
    /// Messages to archive-and-delete (originals, for reversible
    /// archiving).
    pub archived: Vec<Message>,
    /// Messages kept but with pruned tool outputs.
    pub rewrites: Vec<Message>,
}

pub(crate) async fn execute(
    partition: &Partition,
    counter: &TokenCounter,
    summarizer: &Summarizer,
    config: &CompactionConfig,
) -> Result<StrategyOutcome> {
    match config.strategy {
        CompactionStrategy::Summarization => summarize_all(partition, summarizer).await,
        CompactionStrategy::Hybrid => hybrid(partition, counter, summarizer, config).await,
    }
}

/// Context handed to the summarizer: earlier summaries, then pinned
/// messages, chronological.
fn summary_context(partition: &Partition) -> Vec<Message> {
    let mut context = partition.summaries.clone();
    context.extend(partition.preserved.iter().cloned());
    context.sort_by_key(|m| m.created_at);
    context
}

async fn summarize_all(partition: &Partition, summarizer: &Summarizer) -> Result<StrategyOutcome> {
    let summary = summarizer
        .summarize(&summary_context(partition), &partition.compactable)
        .await?;
    Ok(StrategyOutcome {
        summary_text: Some(summary),
        archived: partition.compactable.clone(),
        rewrites: Vec::new(),
    })
}

async fn hybrid(
    partition: &Partition,
    counter: &TokenCounter,
    summarizer: &Summarizer,
    config: &CompactionConfig,
) -> Result<StrategyOutcome> {
    // First pass: collapse oversized tool outputs in the compactable zone.
    let mut pruned = partition.compactable.clone();
    let mut rewrites = Vec::new();
    if !config.preserve_tool_outputs {
        for message in pruned.iter_mut() {
            let mut changed = false;
            for block in message.blocks.iter_mut() {
                if let ContentBlock::ToolResult { content, .. } = block {
                    let block_tokens = (content.len() as u64).div_ceil(4);
                    if block_tokens > config.prune_min_tokens && content != TOOL_OUTPUT_PRUNED {
                        *content = TOOL_OUTPUT_PRUNED.to_string();
                        changed = true;
                    }
                }
            }
            if changed {
                rewrites.push(message.clone());
            }
        }
    }

    let mut pruned_tokens = 0u64;
    for message in &pruned {
        pruned_tokens += counter.count_message(message).await;
    }
    let total_after_prune =
        partition.stats.total_tokens - partition.stats.compactable_tokens + pruned_tokens;

    if total_after_prune <= config.target_tokens {
        tracing::debug!(
            total_after_prune,
            target = config.target_tokens,
            pruned_blocks = rewrites.len(),
            "prune pass reached target, skipping summarization"
        );
        return Ok(StrategyOutcome {
            summary_text: None,
            archived: Vec::new(),
            rewrites,
        });
    }

    // Still over target: summarize the pruned list (smaller prompt), but
    // archive the originals so the archive stays faithful.
    let summary = summarizer.summarize(&summary_context(partition), &pruned).await?;
    Ok(StrategyOutcome {
        summary_text: Some(summary),
        archived: partition.compactable.clone(),
        rewrites: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use am_domain::message::Role;
    use am_model::mock::MockModelClient;
    use std::sync::Arc;
    use uuid::Uuid;

    fn fixtures() -> (Arc<MockModelClient>, TokenCounter, Summarizer) {
        let client = Arc::new(MockModelClient::new());
        let counter = TokenCounter::new(client.clone(), "mock", false);
        let summarizer = Summarizer::new(client.clone(), "mock-summarizer", 1024);
        (client, counter, summarizer)
    }

    fn big_tool_result(session: Uuid, tool_use_id: &str) -> Message {
        Message::new(
            session,
            Role::User,
            vec![ContentBlock::tool_result(tool_use_id, "z".repeat(40_000), false)],
        )
    }

    #[tokio::test]
    async fn hybrid_prune_only_when_target_reached() {
        let (client, counter, summarizer) = fixtures();
        let session = Uuid::new_v4();
        let mut messages = vec![Message::user_text(session, "start")];
        let mut call = Message::assistant_text(session, "running tools");
        for i in 0..3 {
            call.blocks.push(ContentBlock::tool_use(
                format!("t{i}"),
                "search",
                serde_json::json!({}),
            ));
        }
        messages.push(call);
        for i in 0..3 {
            messages.push(big_tool_result(session, &format!("t{i}")));
        }
        messages.push(Message::user_text(session, "recent question"));

        let config = CompactionConfig {
            protected_tokens: 30,
            preserve_last_n: 0,
            target_tokens: 5_000,
            prune_min_tokens: 1_000,
            ..Default::default()
        };
        let p = partition(&messages, &counter, &config).await;
        assert!(!p.compactable.is_empty());

        let outcome = execute(&p, &counter, &summarizer, &config).await.unwrap();
        assert!(outcome.summary_text.is_none(), "summarizer ran despite prune sufficing");
        assert!(outcome.archived.is_empty());
        assert_eq!(outcome.rewrites.len(), 3);
        for rewrite in &outcome.rewrites {
            match &rewrite.blocks[0] {
                ContentBlock::ToolResult { content, .. } => assert_eq!(content, TOOL_OUTPUT_PRUNED),
                other => panic!("unexpected {other:?}"),
            }
        }
        // No model call happened at all.
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn hybrid_falls_through_to_summarization() {
        let (client, counter, summarizer) = fixtures();
        client.push_text("structured summary");
        let session = Uuid::new_v4();
        // Plain text bulk, so pruning has nothing to trim.
        let messages: Vec<Message> = (0..10)
            .map(|_| Message::user_text(session, "w".repeat(4_000)))
            .collect();

        let config = CompactionConfig {
            protected_tokens: 10,
            preserve_last_n: 0,
            target_tokens: 500,
            ..Default::default()
        };
        let p = partition(&messages, &counter, &config).await;
        let outcome = execute(&p, &counter, &summarizer, &config).await.unwrap();
        assert_eq!(outcome.summary_text.as_deref(), Some("structured summary"));
        assert_eq!(outcome.archived.len(), p.compactable.len());
        assert!(outcome.rewrites.is_empty());
    }

    #[tokio::test]
    async fn summarization_strategy_archives_compactable() {
        let (client, counter, summarizer) = fixtures();
        client.push_text("the summary");
        let session = Uuid::new_v4();
        let messages: Vec<Message> = (0..4)
            .map(|_| Message::user_text(session, "q".repeat(400)))
            .collect();
        let config = CompactionConfig {
            strategy: CompactionStrategy::Summarization,
            protected_tokens: 50,
            preserve_last_n: 0,
            ..Default::default()
        };
        let p = partition(&messages, &counter, &config).await;
        let outcome = execute(&p, &counter, &summarizer, &config).await.unwrap();
        assert_eq!(outcome.summary_text.as_deref(), Some("the summary"));
        assert!(!outcome.archived.is_empty());
    }

    #[tokio::test]
    async fn preserve_tool_outputs_disables_pruning() {
        let (_client, counter, summarizer) = fixtures();
        let session = Uuid::new_v4();
        let mut call = Message::assistant_text(session, "call");
        call.blocks.push(ContentBlock::tool_use("t0", "search", serde_json::json!({})));
        let messages = vec![call, big_tool_result(session, "t0"), Message::user_text(session, "tail")];
        let config = CompactionConfig {
            protected_tokens: 10,
            preserve_last_n: 0,
            target_tokens: 1_000_000,
            preserve_tool_outputs: true,
            ..Default::default()
        };
        let p = partition(&messages, &counter, &config).await;
        let outcome = execute(&p, &counter, &summarizer, &config).await.unwrap();
        assert!(outcome.rewrites.is_empty());
    }
}
