use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation thread. Sessions form a forest via `parent_session_id`
/// (agent-as-tool children run in the same session as the parent run, but a
/// caller may also create dedicated child sessions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    /// Unique per tenant.
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Number of compactions applied to this session's history.
    #[serde(default)]
    pub compaction_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(tenant_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            identifier: identifier.into(),
            parent_session_id: None,
            metadata: serde_json::Value::Object(Default::default()),
            compaction_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_session_id = Some(parent);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let parent = Uuid::new_v4();
        let s = Session::new("acme", "support-42")
            .with_parent(parent)
            .with_metadata(serde_json::json!({"channel": "email"}));
        assert_eq!(s.tenant_id, "acme");
        assert_eq!(s.parent_session_id, Some(parent));
        assert_eq!(s.metadata["channel"], "email");
        assert_eq!(s.compaction_count, 0);
    }
}
