//! Error types for the environment abstraction.

use thiserror::Error;

/// Errors that can occur at the environment boundary.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The subject link failed to transfer data
    #[error("Link error: {0}")]
    LinkError(String),

    /// The subject closed the link
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Subject replied with something that can't be interpreted
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a link error.
    pub fn link(msg: impl Into<String>) -> Self {
        Self::LinkError(msg.into())
    }

    /// Creates a closed-link error.
    pub fn closed(subject: impl std::fmt::Display) -> Self {
        Self::LinkClosed(subject.to_string())
    }
}
