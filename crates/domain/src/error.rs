/// Shared error type used across all AgentMesh crates.
///
/// Kinds, not call sites: background loops match on the variant to decide
/// whether to retry, release, or terminalize a single run (see the engine
/// crate). Tool control-flow errors are deliberately separate; see
/// [`crate::tool::ToolError`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Any database failure, wrapping the original driver error.
    #[error("storage: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Startup-time misconfiguration. Fatal.
    #[error("config: {0}")]
    InvalidConfig(String),

    /// Benign: the session has nothing eligible for compaction.
    #[error("no messages to compact")]
    NoMessagesToCompact,

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    /// The token-count API call failed. The counter falls back silently;
    /// this surfaces only when the fallback itself cannot run.
    #[error("token counting failed: {0}")]
    TokenCountingFailed(String),

    /// Optimistic concurrency miss: another worker moved the entity first.
    #[error("state transition refused: {entity} is {current}, requested {requested}")]
    StateTransitionFailed {
        entity: &'static str,
        current: String,
        requested: String,
    },

    /// Malformed session history; the model call is never attempted.
    #[error("build error: {0}")]
    BuildError(String),

    /// A batch ended without a usable result.
    #[error("batch error: {0}")]
    BatchError(String),

    /// Failure from the model API (streaming or batch submission).
    #[error("model: {0}")]
    Model(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a driver-level error as [`Error::Storage`].
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Storage(Box::new(err))
    }

    /// True when the error is an optimistic-concurrency miss that a caller
    /// may retry or ignore because a peer made progress.
    pub fn is_state_transition_failed(&self) -> bool {
        matches!(self, Error::StateTransitionFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_wraps_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "conn reset");
        let err = Error::storage(inner);
        assert!(err.to_string().starts_with("storage:"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn state_transition_detection() {
        let err = Error::StateTransitionFailed {
            entity: "run",
            current: "completed".into(),
            requested: "pending_api".into(),
        };
        assert!(err.is_state_transition_failed());
        assert!(!Error::Cancelled.is_state_transition_failed());
    }
}
