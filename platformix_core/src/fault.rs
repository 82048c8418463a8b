//! Fault injection: canned replies substituted for future matching messages.
//!
//! Rules are registered through the reserved `__testing__` method
//! (`fake_next_op`) and kept per channel in FIFO order. Only the oldest rule
//! of a channel is considered for each inbound message.

use crate::message::{Kwargs, Message, Outcome, TESTING_METHOD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Template compared field by field against inbound messages.
///
/// `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub kwargs: Option<Kwargs>,
}

impl MessageTemplate {
    pub fn matches(&self, message: &Message) -> bool {
        fn field<T: PartialEq>(want: &Option<T>, got: &T) -> bool {
            want.as_ref().map_or(true, |w| w == got)
        }
        self.sender
            .as_ref()
            .map_or(true, |s| message.sender.as_deref() == Some(s.as_str()))
            && field(&self.interface, &message.interface)
            && field(&self.method, &message.method)
            && field(&self.args, &message.args)
            && field(&self.kwargs, &message.kwargs)
    }
}

impl From<&Message> for MessageTemplate {
    /// Every field of the message is significant except an absent sender.
    fn from(message: &Message) -> Self {
        Self {
            sender: message.sender.clone(),
            interface: Some(message.interface.clone()),
            method: Some(message.method.clone()),
            args: Some(message.args.clone()),
            kwargs: Some(message.kwargs.clone()),
        }
    }
}

/// A pre-registered substitution of a reply.
///
/// Execute-mode branches missing from a decoded rule resolve the way
/// [`FaultRule::execute`] resolves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireRule")]
pub struct FaultRule {
    /// Canned reply
    pub reply: Outcome,

    /// Channels the rule watches; empty means the registration channel
    #[serde(default)]
    pub on_channel: Vec<String>,

    #[serde(default)]
    pub on_message: Option<MessageTemplate>,

    /// Matching messages to let through before the rule fires
    #[serde(default)]
    pub after: u32,

    /// Process the message normally and only override the reply
    #[serde(default)]
    pub execute: bool,

    /// With `execute`: override successful results
    pub on_success: bool,

    /// With `execute`: override failed results
    pub on_failure: bool,
}

/// Decoded form of a rule, branches left unset when absent.
#[derive(Deserialize)]
struct WireRule {
    reply: Outcome,
    #[serde(default)]
    on_channel: Vec<String>,
    #[serde(default)]
    on_message: Option<MessageTemplate>,
    #[serde(default)]
    after: u32,
    #[serde(default)]
    execute: bool,
    #[serde(default)]
    on_success: Option<bool>,
    #[serde(default)]
    on_failure: Option<bool>,
}

impl From<WireRule> for FaultRule {
    fn from(w: WireRule) -> Self {
        let rule = FaultRule {
            reply: w.reply,
            on_channel: w.on_channel,
            on_message: w.on_message,
            after: w.after,
            ..FaultRule::new(Outcome::failure(Value::Null))
        };
        if w.execute {
            rule.execute(w.on_success, w.on_failure)
        } else {
            rule
        }
    }
}

impl FaultRule {
    pub fn new(reply: Outcome) -> Self {
        Self {
            reply,
            on_channel: Vec::new(),
            on_message: None,
            after: 0,
            execute: false,
            on_success: false,
            on_failure: false,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.on_channel.push(channel.into());
        self
    }

    pub fn on_message(mut self, template: impl Into<MessageTemplate>) -> Self {
        self.on_message = Some(template.into());
        self
    }

    pub fn after(mut self, after: u32) -> Self {
        self.after = after;
        self
    }

    /// Enables execute mode.
    ///
    /// Unset branches default as follows: neither given overrides successes
    /// only; one given as `false` makes the other `true`.
    pub fn execute(mut self, on_success: Option<bool>, on_failure: Option<bool>) -> Self {
        let (s, f) = match (on_success, on_failure) {
            (None, None) => (true, false),
            (None, Some(false)) => (true, false),
            (Some(false), None) => (false, true),
            (s, f) => (s.unwrap_or(false), f.unwrap_or(false)),
        };
        self.execute = true;
        self.on_success = s;
        self.on_failure = f;
        self
    }

    /// Builds the registration message for `interface`.
    pub fn into_message(self, interface: &str) -> Message {
        let options = serde_json::to_value(&self).unwrap_or(Value::Null);
        Message::call(interface, TESTING_METHOD)
            .with_arg("fake_next_op")
            .with_arg(options)
    }
}

impl From<Message> for MessageTemplate {
    fn from(message: Message) -> Self {
        MessageTemplate::from(&message)
    }
}

/// Replacement of a result branch produced by an execute-mode rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyOverride {
    pub on_success: Option<Outcome>,
    pub on_failure: Option<Outcome>,
}

impl ReplyOverride {
    /// Applies the override to a worker result.
    pub fn apply(&self, outcome: Outcome) -> Outcome {
        let replacement = if outcome.is_success() {
            &self.on_success
        } else {
            &self.on_failure
        };
        replacement.clone().unwrap_or(outcome)
    }
}

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultDecision {
    /// Process normally
    Proceed,
    /// Send this reply instead of processing
    Replace(Outcome),
    /// Process normally, then override the reply branch
    Override(ReplyOverride),
}

/// Fault rules of one protocol instance, FIFO per channel.
#[derive(Debug, Default)]
pub struct FaultQueue {
    rules: HashMap<String, VecDeque<FaultRule>>,
}

impl FaultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `rule` on its channels (or on `arrival_channel`).
    pub fn register(&mut self, arrival_channel: &str, rule: FaultRule) {
        let channels = if rule.on_channel.is_empty() {
            vec![arrival_channel.to_string()]
        } else {
            rule.on_channel.clone()
        };
        for c in channels {
            self.rules.entry(c).or_default().push_back(rule.clone());
        }
    }

    /// Rules queued for `channel`.
    pub fn pending(&self, channel: &str) -> usize {
        self.rules.get(channel).map_or(0, VecDeque::len)
    }

    /// Checks `message` against the oldest rule of `channel`.
    ///
    /// A matching rule with a skip count left has it decremented (unless
    /// `dry_run`); one with no skips left is consumed.
    pub fn check(&mut self, channel: &str, message: &Message, dry_run: bool) -> FaultDecision {
        let Some(queue) = self.rules.get_mut(channel) else {
            return FaultDecision::Proceed;
        };
        let Some(head) = queue.front_mut() else {
            self.rules.remove(channel);
            return FaultDecision::Proceed;
        };
        if let Some(template) = &head.on_message {
            if !template.matches(message) {
                return FaultDecision::Proceed;
            }
        }
        if head.after > 0 {
            if !dry_run {
                head.after -= 1;
            }
            return FaultDecision::Proceed;
        }
        if dry_run {
            return FaultDecision::Replace(head.reply.clone());
        }
        let Some(rule) = queue.pop_front() else {
            return FaultDecision::Proceed;
        };
        if queue.is_empty() {
            self.rules.remove(channel);
        }
        debug!("faking reply on {} for {}", channel, message.summary());
        if rule.execute {
            FaultDecision::Override(ReplyOverride {
                on_success: rule.on_success.then(|| rule.reply.clone()),
                on_failure: rule.on_failure.then(|| rule.reply.clone()),
            })
        } else {
            FaultDecision::Replace(rule.reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn report(what: &str) -> Message {
        Message::call("platformix", "report").with_arg(what)
    }

    #[test]
    fn test_template_wildcards() {
        let t = MessageTemplate {
            method: Some("report".into()),
            ..Default::default()
        };
        assert!(t.matches(&report("running")));
        assert!(!t.matches(&Message::call("platformix", "get")));

        let exact = MessageTemplate::from(&report("is_running"));
        assert!(exact.matches(&report("is_running")));
        assert!(exact.matches(&report("is_running").with_sender("anyone")));
        assert!(!exact.matches(&report("running")));
        assert!(!exact.matches(&report("is_running").with_kwarg("x", 1)));
    }

    #[test]
    fn test_execute_defaults() {
        let r = FaultRule::new(Outcome::failure("x")).execute(None, None);
        assert!(r.on_success && !r.on_failure);
        let r = FaultRule::new(Outcome::failure("x")).execute(Some(false), None);
        assert!(!r.on_success && r.on_failure);
        let r = FaultRule::new(Outcome::failure("x")).execute(None, Some(false));
        assert!(r.on_success && !r.on_failure);
        let r = FaultRule::new(Outcome::failure("x")).execute(Some(true), Some(true));
        assert!(r.on_success && r.on_failure);
    }

    #[test]
    fn test_decoded_execute_rule_resolves_branches() {
        let r: FaultRule = serde_json::from_value(json!({
            "reply": {"result": "failure", "state": "forced", "errcode": -1},
            "execute": true
        }))
        .unwrap();
        assert!(r.execute && r.on_success && !r.on_failure);

        let r: FaultRule = serde_json::from_value(json!({
            "reply": {"result": "failure", "state": "forced", "errcode": -1},
            "execute": true,
            "on_success": false
        }))
        .unwrap();
        assert!(!r.on_success && r.on_failure);

        let r: FaultRule = serde_json::from_value(json!({
            "reply": {"result": "failure", "state": "forced", "errcode": -1}
        }))
        .unwrap();
        assert!(!r.execute && !r.on_success && !r.on_failure);

        let built = FaultRule::new(Outcome::failure("x")).execute(Some(true), Some(true));
        let back: FaultRule = serde_json::from_value(serde_json::to_value(&built).unwrap()).unwrap();
        assert_eq!(back, built);
    }

    #[test]
    fn test_rule_registered_on_arrival_channel() {
        let mut q = FaultQueue::new();
        q.register("@platform_b", FaultRule::new(Outcome::failure("x")));
        assert_eq!(q.pending("@platform_b"), 1);
        q.register("@platform_b", FaultRule::new(Outcome::failure("x")).on_channel("#platforms"));
        assert_eq!(q.pending("#platforms"), 1);
        assert_eq!(q.pending("@platform_b"), 1);
    }

    #[test]
    fn test_head_blocks_later_rules() {
        let mut q = FaultQueue::new();
        q.register(
            "#p",
            FaultRule::new(Outcome::failure("first")).on_message(report("is_running")),
        );
        q.register("#p", FaultRule::new(Outcome::failure("second")));
        assert_eq!(q.check("#p", &report("running"), false), FaultDecision::Proceed);
        assert_eq!(
            q.check("#p", &report("is_running"), false),
            FaultDecision::Replace(Outcome::failure("first"))
        );
        assert_eq!(
            q.check("#p", &report("running"), false),
            FaultDecision::Replace(Outcome::failure("second"))
        );
        assert_eq!(q.pending("#p"), 0);
    }

    #[test]
    fn test_execute_override_branches() {
        let mut q = FaultQueue::new();
        q.register("#p", FaultRule::new(Outcome::failure("forced")).execute(None, None));
        let FaultDecision::Override(ov) = q.check("#p", &report("running"), false) else {
            panic!("expected override");
        };
        assert_eq!(ov.apply(Outcome::success("True")), Outcome::failure("forced"));
        assert_eq!(ov.apply(Outcome::failure("real")), Outcome::failure("real"));
    }

    #[test]
    fn test_registration_message_roundtrip() {
        let rule = FaultRule::new(Outcome::failure("x"))
            .on_channel("#platforms")
            .on_message(report("is_running"))
            .after(2);
        let m = rule.clone().into_message("platformix");
        assert_eq!(m.method, TESTING_METHOD);
        assert_eq!(m.args[0], json!("fake_next_op"));
        let back: FaultRule = serde_json::from_value(m.args[1].clone()).unwrap();
        assert_eq!(back, rule);
    }

    proptest! {
        #[test]
        fn prop_after_skips_exactly(n in 0u32..20, dry_runs in 0usize..5) {
            let mut q = FaultQueue::new();
            q.register("#p", FaultRule::new(Outcome::failure("f")).after(n));
            let m = report("running");
            for _ in 0..dry_runs {
                let _ = q.check("#p", &m, true);
            }
            for _ in 0..n {
                prop_assert_eq!(q.check("#p", &m, false), FaultDecision::Proceed);
            }
            prop_assert_eq!(q.check("#p", &m, false), FaultDecision::Replace(Outcome::failure("f")));
            prop_assert_eq!(q.check("#p", &m, false), FaultDecision::Proceed);
        }
    }
}
