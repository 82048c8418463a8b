//! Scoreboard platform: checks every observed reply against a reference
//! model.
//!
//! The scoreboard joins the channels commands and responses travel on and
//! overhears them. Each command is handed to the rule set, which predicts
//! its reply; the matching response is then compared with the prediction.
//!
//! ```text
//!   @calc ── arith.sum(2, 3) ──► Scoreboard ── predict ──► expected[ctx]
//!   @calc ◄─ success(5) ──────── Scoreboard ── matches ──► success / errors
//! ```
//!
//! Accumulated results are read through `platformix.get`: `scoreboard`
//! returns the counters, `scoreboard_data` the full records.

use crate::error::FactoryError;
use crate::factory::{Blueprint, Parts};
use crate::rules::{Prediction, ScoreboardRules};
use platformix_core::{Kwargs, Message, Outcome, TalkContext, Worker};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Channel every scoreboard joins.
pub const SCOREBOARD_CHANNEL: &str = "#scoreboard";

/// Channel and interface observed messages have to come on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    pub channel: String,
    pub interface: String,
}

impl Tap {
    pub fn new(channel: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            interface: interface.into(),
        }
    }

    pub fn taps(&self, context: &TalkContext) -> bool {
        context.channel() == self.channel && context.interface() == self.interface
    }
}

/// A command or response the scoreboard couldn't accept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub context: String,
    pub message: String,
    pub reason: String,
}

pub struct Scoreboard {
    name: String,
    cmd: Tap,
    res: Tap,
    rules: Box<dyn ScoreboardRules>,

    /// Drop a command's record once its response is checked
    clean_completed: bool,

    pub commands: u64,
    pub responses: u64,
    pub success: u64,
    pub errors: Vec<Finding>,
    pub unhandled: Vec<Finding>,

    /// Predicted reply per command context; `None` for unchecked commands
    expected: BTreeMap<String, Option<Outcome>>,
}

impl Scoreboard {
    pub fn new(name: impl Into<String>, cmd: Tap, res: Tap, rules: Box<dyn ScoreboardRules>) -> Self {
        Self {
            name: name.into(),
            cmd,
            res,
            rules,
            clean_completed: false,
            commands: 0,
            responses: 0,
            success: 0,
            errors: Vec::new(),
            unhandled: Vec::new(),
            expected: BTreeMap::new(),
        }
    }

    pub fn cleaning_completed(mut self) -> Self {
        self.clean_completed = true;
        self
    }

    /// Commands whose record is still kept.
    pub fn queued(&self) -> usize {
        self.expected.len()
    }

    /// Counters, the rule set's statistics merged in.
    pub fn stats(&self) -> Kwargs {
        let mut stats = Kwargs::new();
        stats.insert("requests".into(), Value::from(self.commands));
        stats.insert("responses".into(), Value::from(self.responses));
        stats.insert("success".into(), Value::from(self.success));
        stats.insert("errors".into(), Value::from(self.errors.len()));
        stats.insert("unhandled".into(), Value::from(self.unhandled.len()));
        stats.insert("queued_requests".into(), Value::from(self.queued()));
        stats.extend(self.rules.stats());
        stats
    }

    /// Full records, the rule set's details merged in.
    pub fn data(&self) -> Kwargs {
        let queued: BTreeMap<&String, Option<Message>> = self
            .expected
            .iter()
            .map(|(ctx, o)| (ctx, o.as_ref().map(Outcome::to_message)))
            .collect();
        let mut data = Kwargs::new();
        data.insert("errors".into(), json!(self.errors));
        data.insert("unhandled".into(), json!(self.unhandled));
        data.insert("queued_requests".into(), json!(queued));
        data.extend(self.rules.details());
        data
    }

    fn finding(context: String, message: &Message, reason: String) -> Finding {
        Finding {
            context,
            message: message.summary(),
            reason,
        }
    }

    fn command(&mut self, context: &TalkContext, message: &Message) {
        self.commands += 1;
        let key = context.to_string();
        if self.expected.contains_key(&key) {
            error!("{}: context {} already in results", self.name, key);
            let finding = Self::finding(key, message, "Command repeated in an open context".to_string());
            self.errors.push(finding);
            return;
        }
        match self.rules.predict(message) {
            Prediction::Expect(outcome) => {
                self.expected.insert(key, Some(outcome));
            }
            Prediction::Unhandled(reason) => {
                warn!("{}: command {} can't be handled due to {}", self.name, message.summary(), reason);
                self.unhandled.push(Self::finding(key.clone(), message, reason));
                self.expected.insert(key, None);
            }
        }
    }

    fn response(&mut self, context: &TalkContext, message: &Message) -> bool {
        if !message.is_success() && !message.is_failure() {
            return false;
        }
        self.responses += 1;
        let key = context.to_string();
        let Some(expected) = self.expected.get(&key).cloned() else {
            error!("{}: unexpected response {}", self.name, message.summary());
            self.errors
                .push(Self::finding(key, message, "Response wasn't expected".to_string()));
            return true;
        };
        match expected {
            None => {}
            Some(outcome) if self.rules.matches(&outcome, message) => {
                self.success += 1;
                debug!("{}: response is OK", self.name);
            }
            Some(outcome) => {
                let reason = format!(
                    "Wrong result! Expected: {}, got: {}",
                    outcome.to_message().summary(),
                    message.summary()
                );
                error!("{}: {}", self.name, reason);
                self.errors.push(Self::finding(key.clone(), message, reason));
            }
        }
        if self.clean_completed {
            self.expected.remove(&key);
        }
        true
    }
}

impl Worker for Scoreboard {
    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "scoreboard" => Some(Value::Object(self.stats())),
            "scoreboard_data" => Some(Value::Object(self.data())),
            "clean_completed" => Some(Value::Bool(self.clean_completed)),
            _ => None,
        }
    }

    fn observe(&mut self, context: &TalkContext, message: &Message) -> bool {
        if !message.is_reply() && self.cmd.taps(context) {
            self.command(context, message);
            return true;
        }
        if message.is_reply() && self.res.taps(context) {
            return self.response(context, message);
        }
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Kwargs: `cmd` and `res` (`{channel, interface}`, `res` defaults to
/// `cmd`), `rules`, `rules_kwargs`, `clean_completed`.
pub fn construct(blueprint: &Blueprint<'_>) -> Result<Parts, FactoryError> {
    let cmd: Tap = blueprint.required("cmd")?;
    let res = blueprint.kwarg::<Tap>("res")?.unwrap_or_else(|| cmd.clone());
    let rules_name: String = blueprint.required("rules")?;
    let rules_kwargs = blueprint.kwarg::<Kwargs>("rules_kwargs")?.unwrap_or_default();
    let rules = blueprint.rules().scoreboard(&rules_name, &rules_kwargs)?;

    let mut scoreboard = Scoreboard::new(blueprint.spec.name.clone(), cmd.clone(), res.clone(), rules);
    if blueprint.kwarg::<bool>("clean_completed")?.unwrap_or(false) {
        scoreboard = scoreboard.cleaning_completed();
    }
    let mut parts = Parts::new(Box::new(scoreboard))
        .subscribe(SCOREBOARD_CHANNEL)
        .subscribe(cmd.channel.clone());
    if res.channel != cmd.channel {
        parts = parts.subscribe(res.channel);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::{ArithScoreboard, ARITH};
    use crate::platforms::calc::{arith_protocol, Calc};
    use crate::platforms::sequencer::{sequencer_protocol, Sequencer, SEQUENCER, SEQUENCER_CHANNEL};
    use platformix_core::message::ERRCODE_EXCEPTION;
    use platformix_core::{Component, ComponentSpec, Farm, FarmConfig, Replies, ReplyRouting, PLATFORMIX, PLATFORMS_CHANNEL};
    use platformix_env::ManualContext;

    fn board() -> Scoreboard {
        let tap = Tap::new("@calc", ARITH);
        Scoreboard::new("sb", tap.clone(), tap, Box::new(ArithScoreboard::default()))
    }

    fn ctx(thread: u64) -> TalkContext {
        TalkContext::new("@calc", thread, ARITH)
    }

    fn sum(a: i64, b: i64) -> Message {
        Message::call(ARITH, "sum").with_args([a, b])
    }

    #[test]
    fn test_checks_responses() {
        let mut sb = board();
        assert!(sb.observe(&ctx(0), &sum(2, 3)));
        assert!(sb.observe(&ctx(1), &sum(1, 1)));
        assert!(!sb.observe(&ctx(0), &Message::notify("thinking")));
        assert!(sb.observe(&ctx(0), &Message::success(5)));
        assert!(sb.observe(&ctx(1), &Message::success(3)));

        assert_eq!((sb.commands, sb.responses, sb.success), (2, 2, 1));
        assert_eq!(sb.errors.len(), 1);
        assert!(sb.errors[0].reason.starts_with("Wrong result!"));
        assert_eq!(sb.queued(), 2);
        let stats = sb.stats();
        assert_eq!(stats["errors"], json!(1));
        assert_eq!(stats["by_method"], json!({"sum": 2}));
    }

    #[test]
    fn test_unhandled_and_unexpected() {
        let mut sb = board().cleaning_completed();
        assert!(sb.observe(&ctx(0), &Message::call(ARITH, "sum").with_arg(1)));
        assert_eq!(sb.unhandled.len(), 1);
        assert!(sb.observe(&ctx(0), &Outcome::failure_code("missing operand", ERRCODE_EXCEPTION).to_message()));
        assert!(sb.errors.is_empty());
        assert_eq!(sb.queued(), 0);

        assert!(sb.observe(&ctx(7), &Message::success(1)));
        assert_eq!(sb.errors[0].reason, "Response wasn't expected");
    }

    #[test]
    fn test_ignores_other_taps() {
        let mut sb = board();
        assert!(!sb.observe(&TalkContext::new("@other", 0, ARITH), &sum(1, 2)));
        assert!(!sb.observe(&TalkContext::new("@calc", 0, PLATFORMIX), &Message::call(PLATFORMIX, "get")));
        assert_eq!(sb.commands, 0);
    }

    fn transact(farm: &mut Farm, channel: &str, message: Message) -> Replies {
        let ctx = farm
            .start_conversation(channel, &message.interface.clone(), ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, message, None).unwrap().unwrap()
    }

    #[test]
    fn test_overhears_sequencer_on_bus() {
        let mut farm = Farm::new(FarmConfig::default(), ManualContext::shared(11));
        let calc = Component::new(
            ComponentSpec::new("calc", "calc"),
            Box::new(Calc::mock()),
            vec![arith_protocol().unwrap()],
            farm.config(),
        )
        .unwrap();
        farm.register(calc).unwrap();
        let seq = Component::new(
            ComponentSpec::new("seq", SEQUENCER).with_parent("calc").subscribe(SEQUENCER_CHANNEL),
            Box::new(Sequencer::new(12)),
            vec![sequencer_protocol().unwrap()],
            farm.config(),
        )
        .unwrap();
        farm.register(seq).unwrap();
        let sb = Component::new(
            ComponentSpec::new("sb", "scoreboard").subscribe(SCOREBOARD_CHANNEL).subscribe("@calc"),
            Box::new(board()),
            vec![],
            farm.config(),
        )
        .unwrap();
        farm.register(sb).unwrap();

        let r = transact(&mut farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        assert!(r.values().all(Message::is_success));
        let r = transact(&mut farm, SEQUENCER_CHANNEL, Message::call(SEQUENCER, "run"));
        assert_eq!(r["seq"].value("runs_completed"), Some(&json!(12)));
        assert!(!r.contains_key("sb"));

        let r = transact(&mut farm, SCOREBOARD_CHANNEL, Message::call(PLATFORMIX, "get").with_arg("scoreboard"));
        let stats = r["sb"].value("scoreboard").unwrap();
        assert_eq!(stats["requests"], json!(12));
        assert_eq!(stats["responses"], json!(12));
        assert_eq!(stats["success"], json!(12));
        assert_eq!(stats["errors"], json!(0));
    }
}
