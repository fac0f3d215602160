use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A running worker process. Instances register on startup, heartbeat
/// periodically, and advertise capability sets (agents and tools served) so
/// claims only land where they can be executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub pid: u32,
    pub version: String,
    pub max_concurrent_runs: u32,
    pub max_concurrent_tools: u32,
    /// Advisory counters, reconciled when an instance is evicted.
    #[serde(default)]
    pub active_run_count: u32,
    #[serde(default)]
    pub active_tool_count: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        pid: u32,
        version: impl Into<String>,
        max_concurrent_runs: u32,
        max_concurrent_tools: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            hostname: hostname.into(),
            pid,
            version: version.into(),
            max_concurrent_runs,
            max_concurrent_tools,
            active_run_count: 0,
            active_tool_count: 0,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: now,
            last_heartbeat_at: now,
        }
    }

    /// True when the last heartbeat is older than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.last_heartbeat_at > stale_after
    }
}

/// The singleton leadership lease. At most one row exists; it is valid only
/// while `expires_at > now`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leader {
    pub leader_id: Uuid,
    pub elected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Leader {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness() {
        let mut inst = Instance::new("w1", "host", 42, "0.1.0", 4, 8);
        let now = Utc::now();
        assert!(!inst.is_stale(now, Duration::seconds(60)));
        inst.last_heartbeat_at = now - Duration::seconds(120);
        assert!(inst.is_stale(now, Duration::seconds(60)));
    }

    #[test]
    fn lease_validity() {
        let now = Utc::now();
        let leader = Leader {
            leader_id: Uuid::new_v4(),
            elected_at: now,
            expires_at: now + Duration::seconds(30),
        };
        assert!(leader.is_valid(now));
        assert!(!leader.is_valid(now + Duration::seconds(31)));
    }
}
