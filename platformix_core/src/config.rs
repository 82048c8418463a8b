//! Farm configuration.

use std::time::Duration;

/// Tunables shared by the Farm, its channels and components.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Default limit for waiting on wait-list peers to start
    pub start_max_wait: Duration,

    /// Default limit for waiting on children/dependents to stop
    pub stop_max_wait: Duration,

    /// Default timeout of requests issued by workers
    pub request_timeout: Duration,

    /// How long a drain waits on outstanding tickets without any progress
    pub ticket_wait: Duration,

    /// Log every delivery at debug level
    pub print_messages: bool,

    /// Keep per-thread conversation records
    pub gather_conversation: bool,

    /// Also record deliveries nobody accepted
    pub gather_all: bool,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            start_max_wait: Duration::from_secs(10),
            stop_max_wait: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            ticket_wait: Duration::from_secs(30),
            print_messages: false,
            gather_conversation: true,
            gather_all: false,
        }
    }
}
