//! Engine configuration, loaded from TOML by the binary and defaulted
//! field-by-field so a partial config file is always valid.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl EngineConfig {
    /// Startup-time validation. Misconfiguration is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.instance.max_concurrent_runs == 0 {
            return Err(Error::InvalidConfig("instance.max_concurrent_runs must be > 0".into()));
        }
        if self.instance.max_concurrent_tools == 0 {
            return Err(Error::InvalidConfig("instance.max_concurrent_tools must be > 0".into()));
        }
        if self.workers.leader_ttl_secs == 0 {
            return Err(Error::InvalidConfig("workers.leader_ttl_secs must be > 0".into()));
        }
        if self.tools.default_max_attempts == 0 {
            return Err(Error::InvalidConfig("tools.default_max_attempts must be > 0".into()));
        }
        self.compaction.validate()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instance identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Display name; defaults to `<hostname>-<pid>` when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default = "d_4")]
    pub max_concurrent_runs: u32,
    #[serde(default = "d_8")]
    pub max_concurrent_tools: u32,
    #[serde(default = "d_10")]
    pub heartbeat_interval_secs: u64,
    /// Peers with heartbeats older than this are evicted by the leader.
    #[serde(default = "d_60")]
    pub stale_after_secs: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent_runs: 4,
            max_concurrent_tools: 8,
            heartbeat_interval_secs: 10,
            stale_after_secs: 60,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker loops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Polling backstop for run claims when notifications are lost.
    #[serde(default = "d_5")]
    pub run_poll_interval_secs: u64,
    #[serde(default = "d_5")]
    pub tool_poll_interval_secs: u64,
    #[serde(default = "d_10")]
    pub batch_poll_interval_secs: u64,
    /// Scan for stuck `pending_tools` runs and expired claims.
    #[serde(default = "d_30")]
    pub stuck_scan_interval_secs: u64,
    /// Claims older than this on non-terminal runs are released.
    #[serde(default = "d_300")]
    pub claim_timeout_secs: u64,
    #[serde(default = "d_30")]
    pub leader_ttl_secs: u64,
    /// Delay before the notifier listen loop reconnects after a drop.
    #[serde(default = "d_5")]
    pub notify_reconnect_delay_secs: u64,
    /// Hard cap on iterations per run; exceeded runs fail.
    #[serde(default = "d_50")]
    pub max_iterations_per_run: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            run_poll_interval_secs: 5,
            tool_poll_interval_secs: 5,
            batch_poll_interval_secs: 10,
            stuck_scan_interval_secs: 30,
            claim_timeout_secs: 300,
            leader_ttl_secs: 30,
            notify_reconnect_delay_secs: 5,
            max_iterations_per_run: 50,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "d_3")]
    pub default_max_attempts: u32,
    /// Hard per-call timeout; a timed-out call is an ordinary error.
    #[serde(default = "d_300")]
    pub execution_timeout_secs: u64,
    /// Retry backoff is `retry_base_delay_ms * attempt⁴`, capped below.
    #[serde(default = "d_500")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "d_300")]
    pub max_retry_delay_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            execution_timeout_secs: 300,
            retry_base_delay_ms: 500,
            max_retry_delay_secs: 300,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Fallback model for agents that don't name one.
    #[serde(default = "d_default_model")]
    pub default_model: String,
    #[serde(default = "d_8192")]
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4-5".into(),
            max_output_tokens: 8192,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which rewrite the compactor applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// Summarize compactable messages into one assistant summary message.
    Summarization,
    /// Prune oversized tool results first; summarize only if still over
    /// target.
    Hybrid,
}

impl CompactionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summarization => "summarization",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Compaction keeps a session's token count under budget by pruning and/or
/// summarizing history. One canonical default set lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "d_hybrid")]
    pub strategy: CompactionStrategy,
    /// Compaction triggers when total tokens exceed
    /// `trigger * max_tokens_for_model`. Must be in (0, 1].
    #[serde(default = "d_085")]
    pub trigger: f64,
    /// Desired post-compaction size.
    #[serde(default = "d_150k")]
    pub target_tokens: u64,
    /// Recent messages kept verbatim ahead of the protected suffix.
    #[serde(default = "d_10u")]
    pub preserve_last_n: usize,
    /// Minimum protected trailing suffix, in tokens.
    #[serde(default = "d_30k")]
    pub protected_tokens: u64,
    #[serde(default = "d_summarizer_model")]
    pub summarizer_model: String,
    #[serde(default = "d_4096")]
    pub summarizer_max_tokens: u32,
    /// Context window of the conversation model.
    #[serde(default = "d_200k")]
    pub max_tokens_for_model: u64,
    /// When true, the hybrid strategy leaves tool outputs alone.
    #[serde(default)]
    pub preserve_tool_outputs: bool,
    /// Count via the model API (with char fallback) instead of chars only.
    #[serde(default = "d_true")]
    pub use_token_counting_api: bool,
    /// Tool results accumulated past this size are pruned by hybrid.
    #[serde(default = "d_1000")]
    pub prune_min_tokens: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Hybrid,
            trigger: 0.85,
            target_tokens: 150_000,
            preserve_last_n: 10,
            protected_tokens: 30_000,
            summarizer_model: "claude-haiku-4-5".into(),
            summarizer_max_tokens: 4096,
            max_tokens_for_model: 200_000,
            preserve_tool_outputs: false,
            use_token_counting_api: true,
            prune_min_tokens: 1000,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.trigger > 0.0 && self.trigger <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction.trigger must be in (0, 1], got {}",
                self.trigger
            )));
        }
        if self.max_tokens_for_model == 0 {
            return Err(Error::InvalidConfig("compaction.max_tokens_for_model must be > 0".into()));
        }
        if self.target_tokens >= self.max_tokens_for_model {
            return Err(Error::InvalidConfig(format!(
                "compaction.target_tokens ({}) must be below max_tokens_for_model ({})",
                self.target_tokens, self.max_tokens_for_model
            )));
        }
        if self.summarizer_max_tokens == 0 {
            return Err(Error::InvalidConfig("compaction.summarizer_max_tokens must be > 0".into()));
        }
        Ok(())
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_4() -> u32 {
    4
}
fn d_8() -> u32 {
    8
}
fn d_5() -> u64 {
    5
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_300() -> u64 {
    300
}
fn d_500() -> u64 {
    500
}
fn d_50() -> u32 {
    50
}
fn d_1000() -> u64 {
    1000
}
fn d_4096() -> u32 {
    4096
}
fn d_8192() -> u32 {
    8192
}
fn d_10u() -> usize {
    10
}
fn d_30k() -> u64 {
    30_000
}
fn d_150k() -> u64 {
    150_000
}
fn d_200k() -> u64 {
    200_000
}
fn d_085() -> f64 {
    0.85
}
fn d_hybrid() -> CompactionStrategy {
    CompactionStrategy::Hybrid
}
fn d_default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn d_summarizer_model() -> String {
    "claude-haiku-4-5".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn trigger_bounds() {
        let mut cfg = CompactionConfig::default();
        cfg.trigger = 0.0;
        assert!(cfg.validate().is_err());
        cfg.trigger = 1.0;
        cfg.validate().unwrap();
        cfg.trigger = 1.01;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn target_below_window() {
        let mut cfg = CompactionConfig::default();
        cfg.target_tokens = cfg.max_tokens_for_model;
        assert!(cfg.validate().is_err());
    }
}
