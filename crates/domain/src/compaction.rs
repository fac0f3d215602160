//! Compaction audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable audit record of one compaction of a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Strategy that ran: `"summarization"` or `"hybrid"`.
    pub strategy: String,
    pub original_tokens: u64,
    pub compacted_tokens: u64,
    pub messages_removed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_content: Option<String>,
    /// Messages the partition kept verbatim.
    pub preserved_message_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Full JSON body of a message deleted by compaction, kept for
/// reversibility. Keyed by the compaction event that removed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageArchive {
    pub id: Uuid,
    pub compaction_event_id: Uuid,
    pub message_id: Uuid,
    pub session_id: Uuid,
    /// The archived message serialized as JSON.
    pub body: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}
