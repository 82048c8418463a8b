//! Error types for the bus engine.
//!
//! Everything here is a contract violation by a caller or a component.
//! Operational failures (a worker failing to start, a dependency timing
//! out) are never errors: they travel as failure replies.

use thiserror::Error;

/// Errors raised by the bus engine.
#[derive(Debug, Error)]
pub enum BusError {
    /// Message shape or conversation rule broken
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send to a channel nobody created
    #[error("Channel {0} doesn't exist")]
    UnknownChannel(String),

    /// Send to a thread that was never started
    #[error("Thread {thread} doesn't exist at channel {channel}")]
    UnknownThread { channel: String, thread: u64 },

    /// Second reply handler for the same context
    #[error("Reply handler for {0} is already registered")]
    DuplicateHandler(String),

    /// Unregister of a handler that isn't there
    #[error("Reply handler for {0} not found")]
    MissingHandler(String),

    /// Component name not present in the Farm
    #[error("Component {0} is not registered")]
    UnknownComponent(String),

    /// Component name registered twice
    #[error("Component {0} is already registered")]
    DuplicateComponent(String),

    /// Component listed itself as a prerequisite
    #[error("Component {0} can't wait for itself")]
    SelfWait(String),

    /// Awaiting registrations depend on each other
    #[error("Dependency cycle between components: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Interface method without implementation at construction time
    #[error("Method {method} of interface {interface} is not bound")]
    UnboundMethod { interface: String, method: String },

    /// Method table entry for a method the interface doesn't declare
    #[error("Method {method} is not part of interface {interface}")]
    UndeclaredMethod { interface: String, method: String },

    /// Tickets stayed unanswered past the configured wait
    #[error("{count} ticket(s) unanswered after {waited:?}")]
    StalledTickets { count: usize, waited: std::time::Duration },

    /// Top-level transaction issued while another one is draining
    #[error("Transaction already in progress")]
    TransactionInProgress,
}

impl BusError {
    /// Creates a protocol violation.
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Creates a malformed-message violation.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(format!("malformed message: {}", msg.into()))
    }
}
