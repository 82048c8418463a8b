//! Conversation context: the correlation key of the bus.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one conversation: `(channel, thread, interface)`.
///
/// Created when a conversation starts and never mutated afterwards. Its
/// string form `channel:thread:interface` is what logs and diagnostics show;
/// maps key on the struct itself so names containing `:` can't collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TalkContext {
    channel: String,
    thread: u64,
    interface: String,
}

impl TalkContext {
    pub fn new(channel: impl Into<String>, thread: u64, interface: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread,
            interface: interface.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Correlation key string.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TalkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.thread, self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_context_key_format() {
        let c = TalkContext::new("#platforms", 3, "platformix");
        assert_eq!(c.key(), "#platforms:3:platformix");
        assert_eq!(c.channel(), "#platforms");
        assert_eq!(c.thread(), 3);
        assert_eq!(c.interface(), "platformix");
    }

    #[test]
    fn test_context_distinct_threads() {
        let mut seen = HashSet::new();
        for t in 0..10 {
            assert!(seen.insert(TalkContext::new("@calc", t, "arith")));
        }
        assert!(!seen.insert(TalkContext::new("@calc", 4, "arith")));
    }
}
