//! Error types for the harness.

use platformix_core::BusError;
use thiserror::Error;

/// Environment description can't be used.
#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("Failed to parse environment description: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read environment description: {0}")]
    Io(#[from] std::io::Error),

    /// Alias with the same name as a platform
    #[error("Alias {0} shadows a platform")]
    AliasShadowing(String),

    #[error("Alias {alias} points to unknown platform {target}")]
    UnknownAlias { alias: String, target: String },

    /// Wait limit that isn't a finite non-negative number of seconds
    #[error("Platform {platform}: {field} must be a non-negative number of seconds")]
    InvalidLimit { platform: String, field: &'static str },
}

/// Component construction failed.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// No constructor registered for the kind
    #[error("Platform kind {0} not found")]
    NotFound(String),

    #[error("Platform {platform}: bad argument {argument}: {reason}")]
    BadArgument {
        platform: String,
        argument: String,
        reason: String,
    },

    /// No subject link registered under the name
    #[error("Subject {0} not found")]
    UnknownSubject(String),

    /// No rule set registered under the name
    #[error("Rules {0} not found")]
    UnknownRules(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors of setting up or driving a test session.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// Platforms whose parent or wait-list never got registered
    #[error("Platforms {0:?} wait for platforms that don't exist")]
    Unresolved(Vec<String>),

    /// Include list names tests the suite doesn't have
    #[error("Tests {missing:?} were not found in: {available:?}")]
    UnknownTests {
        missing: Vec<String>,
        available: Vec<String>,
    },
}
