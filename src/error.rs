//! Error taxonomy for the assistant core.
//!
//! Collaborators (readers, embedders, model clients) report failures as
//! [`anyhow::Error`]. The pipeline wraps them into an [`AgentError`] at the
//! stage where they surfaced, so callers can tell an indexing problem from a
//! model outage without parsing messages.
//!
//! "No index configured" is not an error: retrieval simply yields nothing.

use std::time::Duration;

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by a single pipeline invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A lookup file was unreadable, unsupported, or could not be embedded.
    #[error("index build failed: {0:#}")]
    IndexBuild(anyhow::Error),

    /// The embedding provider failed while searching the index.
    #[error("retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),

    /// The language model failed during condensation or generation.
    #[error("model inference failed: {0:#}")]
    ModelInference(anyhow::Error),

    /// The invocation was missing a required field or carried an invalid one.
    #[error("invalid request: {0}")]
    Configuration(String),

    /// The whole invocation exceeded the configured timeout.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),
}

impl AgentError {
    /// Short machine-readable code, used by the HTTP API.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::IndexBuild(_) => "index_build",
            AgentError::Retrieval(_) => "retrieval",
            AgentError::ModelInference(_) => "model_inference",
            AgentError::Configuration(_) => "bad_request",
            AgentError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause_chain() {
        let err = AgentError::IndexBuild(
            anyhow::anyhow!("permission denied").context("failed to read notes.txt"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("index build failed"));
        assert!(msg.contains("notes.txt"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            AgentError::Configuration("query".into()).code(),
            "bad_request"
        );
        assert_eq!(AgentError::Timeout(Duration::from_secs(1)).code(), "timeout");
    }
}
