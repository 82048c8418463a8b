//! Small shared types.

use std::time::Duration;
use uuid::Uuid;

/// Generates a unique name for a component declared without one.
///
/// Uses the first 8 characters of a random UUID, e.g. `platformix-1a2b3c4d`.
pub fn generated_name(kind: &str) -> String {
    let id = Uuid::new_v4().to_string();
    format!("{}-{}", kind, &id[..8])
}

/// An absolute deadline on a `BusContext` clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Duration);

impl Deadline {
    /// Deadline `timeout` after `now`.
    pub fn after(now: Duration, timeout: Duration) -> Self {
        Self(now + timeout)
    }

    /// Returns true once `now` has reached the deadline.
    pub fn expired(&self, now: Duration) -> bool {
        now >= self.0
    }

    /// Time left before the deadline (zero when expired).
    pub fn remaining(&self, now: Duration) -> Duration {
        self.0.saturating_sub(now)
    }

    /// The absolute instant on the context clock.
    pub fn at(&self) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generated_name_unique() {
        let a = generated_name("calc");
        let b = generated_name("calc");
        assert!(a.starts_with("calc-"));
        assert_eq!(a.len(), "calc-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_deadline_expiry() {
        let d = Deadline::after(Duration::from_secs(1), Duration::from_secs(10));
        assert!(!d.expired(Duration::from_secs(5)));
        assert_eq!(d.remaining(Duration::from_secs(5)), Duration::from_secs(6));
        assert!(d.expired(Duration::from_secs(11)));
        assert_eq!(d.remaining(Duration::from_secs(20)), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_deadline_expired_iff_reached(start in 0u64..1_000_000, timeout in 0u64..1_000_000, now in 0u64..3_000_000) {
            let d = Deadline::after(Duration::from_micros(start), Duration::from_micros(timeout));
            prop_assert_eq!(d.expired(Duration::from_micros(now)), now >= start + timeout);
        }
    }
}
