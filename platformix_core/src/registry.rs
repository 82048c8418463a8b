//! Per-component registry of outstanding requests awaiting replies.

use crate::context::TalkContext;
use crate::error::BusError;
use crate::message::Kwargs;
use platformix_env::Deadline;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// What to run when a reply (or the deadline) arrives for a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// Completes on the first success or failure reply; `tag` names the
    /// worker continuation to resume, if any
    Request { tag: Option<String> },

    /// Lifecycle: waiting for wait-list peers to start
    StartWait,

    /// Lifecycle: waiting for children/dependents to stop
    StopWait,
}

/// A live registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub kind: HandlerKind,

    /// Extra arguments handed back to the handler
    pub args: Vec<Value>,
    pub kwargs: Kwargs,

    /// Whether the handler gets the reply message itself
    pub send_message: bool,

    pub deadline: Option<Deadline>,

    /// Move the terminal state to the end-state map on completion
    pub store_state: bool,

    timeout_fired: bool,
}

impl RegistryEntry {
    pub fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
            kwargs: Kwargs::new(),
            send_message: true,
            deadline: None,
            store_state: false,
            timeout_fired: false,
        }
    }

    /// Sets an absolute deadline `timeout` after `now`.
    pub fn with_timeout(mut self, now: Duration, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Deadline::after(now, t));
        self
    }

    pub fn with_store_state(mut self, store_state: bool) -> Self {
        self.store_state = store_state;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>, kwargs: Kwargs) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }

    pub fn with_send_message(mut self, send_message: bool) -> Self {
        self.send_message = send_message;
        self
    }

    /// Deadline passed (or its timeout already fired).
    pub fn timed_out(&self, now: Duration) -> bool {
        self.timeout_fired || self.deadline.map_or(false, |d| d.expired(now))
    }
}

/// Outstanding requests of one component, keyed by context.
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    entries: HashMap<TalkContext, RegistryEntry>,
    end_states: HashMap<TalkContext, Kwargs>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `context`.
    ///
    /// # Errors
    /// `DuplicateHandler` if one is already registered and `force` is false.
    pub fn register(
        &mut self,
        context: TalkContext,
        entry: RegistryEntry,
        force: bool,
    ) -> Result<(), BusError> {
        if !force && self.entries.contains_key(&context) {
            return Err(BusError::DuplicateHandler(context.key()));
        }
        self.entries.insert(context, entry);
        Ok(())
    }

    /// Removes the handler for `context`.
    ///
    /// With `store_state` on the entry, `state` plus `__success__` is parked
    /// in the end-state map for one-time retrieval.
    ///
    /// # Errors
    /// `MissingHandler` if nothing is registered and `dont_check` is false;
    /// a violation if an end state for the context is already parked.
    pub fn unregister(
        &mut self,
        context: &TalkContext,
        success: bool,
        mut state: Kwargs,
        dont_check: bool,
    ) -> Result<Option<RegistryEntry>, BusError> {
        let Some(entry) = self.entries.remove(context) else {
            if dont_check {
                return Ok(None);
            }
            return Err(BusError::MissingHandler(context.key()));
        };
        if entry.store_state {
            if self.end_states.contains_key(context) {
                return Err(BusError::violation(format!(
                    "end state for {} is already stored",
                    context
                )));
            }
            state.insert("__success__".into(), Value::Bool(success));
            self.end_states.insert(context.clone(), state);
        }
        Ok(Some(entry))
    }

    pub fn get(&self, context: &TalkContext) -> Option<&RegistryEntry> {
        self.entries.get(context)
    }

    pub fn contains(&self, context: &TalkContext) -> bool {
        self.entries.contains_key(context)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Takes the parked end state of a completed request.
    pub fn pop_end_state(&mut self, context: &TalkContext) -> Option<Kwargs> {
        self.end_states.remove(context)
    }

    /// Contexts whose deadline elapsed and whose timeout hasn't fired yet.
    ///
    /// Each returned entry is marked so it is never reported again.
    pub fn take_due(&mut self, now: Duration) -> Vec<TalkContext> {
        let mut due: Vec<TalkContext> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.timeout_fired && e.deadline.map_or(false, |d| d.expired(now)))
            .map(|(c, e)| {
                e.timeout_fired = true;
                c.clone()
            })
            .collect();
        due.sort();
        due
    }

    /// Drops an entry without storing anything.
    pub fn discard(&mut self, context: &TalkContext) -> Option<RegistryEntry> {
        self.entries.remove(context)
    }

    /// Contexts with live handlers, sorted.
    pub fn contexts(&self) -> Vec<TalkContext> {
        let mut all: Vec<_> = self.entries.keys().cloned().collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(t: u64) -> TalkContext {
        TalkContext::new("#platforms", t, "platformix")
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut r = ReplyRegistry::new();
        r.register(ctx(0), RegistryEntry::new(HandlerKind::StartWait), false).unwrap();
        let dup = r.register(ctx(0), RegistryEntry::new(HandlerKind::StopWait), false);
        assert!(matches!(dup, Err(BusError::DuplicateHandler(_))));
        r.register(ctx(0), RegistryEntry::new(HandlerKind::StopWait), true).unwrap();
        assert_eq!(r.get(&ctx(0)).unwrap().kind, HandlerKind::StopWait);
    }

    #[test]
    fn test_unregister_missing() {
        let mut r = ReplyRegistry::new();
        assert!(matches!(
            r.unregister(&ctx(1), true, Kwargs::new(), false),
            Err(BusError::MissingHandler(_))
        ));
        assert!(r.unregister(&ctx(1), true, Kwargs::new(), true).unwrap().is_none());
    }

    #[test]
    fn test_end_state_retrieved_once() {
        let mut r = ReplyRegistry::new();
        let entry = RegistryEntry::new(HandlerKind::Request { tag: None }).with_store_state(true);
        r.register(ctx(2), entry, false).unwrap();
        let mut state = Kwargs::new();
        state.insert("detail".into(), Value::from(1));
        r.unregister(&ctx(2), false, state, false).unwrap();

        let end = r.pop_end_state(&ctx(2)).unwrap();
        assert_eq!(end["__success__"], Value::Bool(false));
        assert_eq!(end["detail"], Value::from(1));
        assert!(r.pop_end_state(&ctx(2)).is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn test_timeouts_fire_once() {
        let mut r = ReplyRegistry::new();
        let now = Duration::from_secs(0);
        r.register(
            ctx(0),
            RegistryEntry::new(HandlerKind::StartWait).with_timeout(now, Some(Duration::from_secs(2))),
            false,
        )
        .unwrap();
        r.register(
            ctx(1),
            RegistryEntry::new(HandlerKind::StopWait).with_timeout(now, Some(Duration::from_secs(5))),
            false,
        )
        .unwrap();
        r.register(ctx(2), RegistryEntry::new(HandlerKind::Request { tag: None }), false)
            .unwrap();

        assert!(r.take_due(Duration::from_secs(1)).is_empty());
        assert_eq!(r.take_due(Duration::from_secs(3)), vec![ctx(0)]);
        assert!(r.take_due(Duration::from_secs(4)).is_empty());
        assert!(r.get(&ctx(0)).unwrap().timed_out(Duration::from_secs(0)));
        assert_eq!(r.take_due(Duration::from_secs(60)), vec![ctx(1)]);
        assert!(!r.get(&ctx(2)).unwrap().timed_out(Duration::from_secs(3600)));
    }
}
