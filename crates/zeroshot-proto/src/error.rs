//! Common error types for the zeroshot orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the zeroshot crates.
pub type Result<T> = std::result::Result<T, Error>;

/// The shared error taxonomy.
///
/// Provisioning errors (`NotAGitRepo`, `IsolationFailed`,
/// `ProviderUnavailable`, `ConfigInvalid`) abort cluster start before any
/// cluster is registered. Runtime errors are confined to the affected agent
/// and surface through its `on_error` hook.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before any side effect.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The requested working directory is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// Sandbox provisioning (worktree or container) failed.
    #[error("isolation failed: {0}")]
    IsolationFailed(String),

    /// The provider CLI binary could not be found.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Non-zero exit or parse failure during an agent execution.
    #[error("provider failure: {0}")]
    TransientProviderFailure(String),

    /// The direct API returned HTTP 429.
    #[error("rate limited by provider API")]
    RateLimited,

    /// An agent's provider subprocess exceeded its configured timeout.
    #[error("agent '{agent}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    /// Caller-initiated cancellation via stop/kill.
    #[error("cancelled")]
    Cancelled,

    /// Structured output could not be recovered from the provider response.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the agent retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited | Error::TransientProviderFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::RateLimited.is_retryable());
        assert!(Error::TransientProviderFailure("exit 1".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::AgentTimeout {
            agent: "worker".into(),
            timeout_ms: 1000
        }
        .is_retryable());
        assert!(!Error::ConfigInvalid("bad".into()).is_retryable());
    }
}
