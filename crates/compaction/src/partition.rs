//! Partitioning — classifies a session's messages into the five disjoint
//! compaction buckets.

use am_domain::config::CompactionConfig;
use am_domain::message::Message;

use crate::token_counter::TokenCounter;

/// The five disjoint buckets. Ordering within each is chronological and
/// their union is exactly the input.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// Trailing suffix under the `protected_tokens` budget. Never touched.
    pub protected: Vec<Message>,
    /// Up to `preserve_last_n` messages immediately before Protected
    /// (plus any pulled in to keep tool_use/tool_result pairs together).
    pub recent: Vec<Message>,
    /// Earlier compaction summaries outside the regions above.
    pub summaries: Vec<Message>,
    /// Messages pinned with `is_preserved` outside the regions above.
    pub preserved: Vec<Message>,
    /// Everything else: what compaction may rewrite or remove.
    pub compactable: Vec<Message>,
    pub stats: PartitionStats,
}

/// Per-bucket token sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub protected_tokens: u64,
    pub recent_tokens: u64,
    pub summary_tokens: u64,
    pub preserved_tokens: u64,
    pub compactable_tokens: u64,
    pub total_tokens: u64,
}

/// Bucket the message list per the compaction config.
///
/// The boundary between Compactable and the kept region never splits a
/// tool_use/tool_result pair: if it would fall immediately after a message
/// ending in `tool_use`, or immediately before one starting with
/// `tool_result`, it moves one message earlier (growing Recent).
pub async fn partition(
    messages: &[Message],
    counter: &TokenCounter,
    config: &CompactionConfig,
) -> Partition {
    let mut tokens = Vec::with_capacity(messages.len());
    for message in messages {
        tokens.push(counter.count_message(message).await);
    }

    // Protected: longest trailing suffix whose cumulative tokens stay
    // within the budget.
    let mut protected_start = messages.len();
    let mut cumulative = 0u64;
    while protected_start > 0 {
        let next = cumulative + tokens[protected_start - 1];
        if next > config.protected_tokens {
            break;
        }
        cumulative = next;
        protected_start -= 1;
    }

    // Recent: up to preserve_last_n messages immediately before Protected.
    let mut boundary = protected_start.saturating_sub(config.preserve_last_n);

    // Keep tool pairs on one side of the boundary.
    while boundary > 0 {
        let splits_pair = messages[boundary - 1].ends_with_tool_use()
            || messages
                .get(boundary)
                .map(Message::starts_with_tool_result)
                .unwrap_or(false);
        if !splits_pair {
            break;
        }
        boundary -= 1;
    }

    let mut partition = Partition::default();
    for (i, message) in messages.iter().enumerate() {
        let bucket_tokens = tokens[i];
        partition.stats.total_tokens += bucket_tokens;
        if i >= protected_start {
            partition.stats.protected_tokens += bucket_tokens;
            partition.protected.push(message.clone());
        } else if i >= boundary {
            partition.stats.recent_tokens += bucket_tokens;
            partition.recent.push(message.clone());
        } else if message.is_summary {
            partition.stats.summary_tokens += bucket_tokens;
            partition.summaries.push(message.clone());
        } else if message.is_preserved {
            partition.stats.preserved_tokens += bucket_tokens;
            partition.preserved.push(message.clone());
        } else {
            partition.stats.compactable_tokens += bucket_tokens;
            partition.compactable.push(message.clone());
        }
    }
    partition
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_domain::message::{ContentBlock, Role};
    use am_model::mock::MockModelClient;
    use std::sync::Arc;
    use uuid::Uuid;

    fn counter() -> TokenCounter {
        TokenCounter::new(Arc::new(MockModelClient::new()), "mock", false)
    }

    fn config(protected: u64, last_n: usize) -> CompactionConfig {
        CompactionConfig {
            protected_tokens: protected,
            preserve_last_n: last_n,
            ..Default::default()
        }
    }

    /// ~24 tokens apiece (80 chars text + 4 overhead).
    fn msg(session: Uuid, text_len: usize) -> Message {
        Message::user_text(session, "x".repeat(text_len))
    }

    #[tokio::test]
    async fn buckets_are_disjoint_and_complete() {
        let session = Uuid::new_v4();
        let mut messages: Vec<Message> = (0..10).map(|_| msg(session, 80)).collect();
        messages[1].is_preserved = true;
        messages[2].is_summary = true;

        let p = partition(&messages, &counter(), &config(48, 2)).await;
        let total = p.protected.len() + p.recent.len() + p.summaries.len() + p.preserved.len() + p.compactable.len();
        assert_eq!(total, messages.len());

        let mut ids: Vec<Uuid> = p
            .protected
            .iter()
            .chain(&p.recent)
            .chain(&p.summaries)
            .chain(&p.preserved)
            .chain(&p.compactable)
            .map(|m| m.id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), messages.len(), "buckets overlapped");
        assert_eq!(
            p.stats.total_tokens,
            p.stats.protected_tokens
                + p.stats.recent_tokens
                + p.stats.summary_tokens
                + p.stats.preserved_tokens
                + p.stats.compactable_tokens
        );
    }

    #[tokio::test]
    async fn protected_suffix_respects_budget() {
        let session = Uuid::new_v4();
        // Each message is 24 tokens; a 48-token budget protects exactly 2.
        let messages: Vec<Message> = (0..5).map(|_| msg(session, 80)).collect();
        let p = partition(&messages, &counter(), &config(48, 0)).await;
        assert_eq!(p.protected.len(), 2);
        assert!(p.stats.protected_tokens <= 48);
        assert_eq!(p.compactable.len(), 3);
    }

    #[tokio::test]
    async fn recent_sits_before_protected() {
        let session = Uuid::new_v4();
        let messages: Vec<Message> = (0..6).map(|_| msg(session, 80)).collect();
        let p = partition(&messages, &counter(), &config(24, 2)).await;
        assert_eq!(p.protected.len(), 1);
        assert_eq!(p.recent.len(), 2);
        assert_eq!(p.compactable.len(), 3);
        // Chronology: compactable before recent before protected.
        assert_eq!(p.recent[0].id, messages[3].id);
        assert_eq!(p.protected[0].id, messages[5].id);
    }

    #[tokio::test]
    async fn boundary_never_splits_tool_pair() {
        let session = Uuid::new_v4();
        let mut messages: Vec<Message> = (0..4).map(|_| msg(session, 80)).collect();
        // messages[1] ends with tool_use, messages[2] starts with its result.
        messages[1] = Message::new(
            session,
            Role::Assistant,
            vec![
                ContentBlock::text("calling"),
                ContentBlock::tool_use("t1", "exec", serde_json::json!({})),
            ],
        );
        messages[2] = Message::new(
            session,
            Role::User,
            vec![ContentBlock::tool_result("t1", "done", false)],
        );

        // Budget puts the raw boundary exactly between [1] and [2].
        let p = partition(&messages, &counter(), &config(30, 1)).await;
        let compactable_ids: Vec<Uuid> = p.compactable.iter().map(|m| m.id).collect();
        let kept_ids: Vec<Uuid> = p.recent.iter().chain(&p.protected).map(|m| m.id).collect();
        let pair_split = compactable_ids.contains(&messages[1].id) && kept_ids.contains(&messages[2].id);
        assert!(!pair_split, "tool pair was split across the boundary");
    }

    #[tokio::test]
    async fn empty_input() {
        let p = partition(&[], &counter(), &config(100, 2)).await;
        assert!(p.compactable.is_empty());
        assert_eq!(p.stats.total_tokens, 0);
    }
}
