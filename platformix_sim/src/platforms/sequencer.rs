//! Sequencer platform: drives a calculator with seeded random requests.
//!
//! `run` issues its requests one at a time. Each reply is checked against
//! the locally computed result before the next request goes out; the run
//! replies once the last request completed or a `break` arrived.
//!
//! ```text
//!   #sequencer ── run(n) ──► Sequencer ── arith.<op>(a, b) ──► @target
//!                              ▲                                  │
//!                              └──── on_reply("step") ◄───────────┘
//! ```

use crate::arith::{ArithOp, ARITH};
use crate::error::FactoryError;
use crate::factory::{Blueprint, Parts};
use platformix_core::{
    Call, Completion, Interface, Kwargs, Message, MethodTable, Outcome, Protocol, RequestEnd, RequestOptions,
    TalkContext, Worker, WorkerCx,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::any::Any;
use tracing::{debug, info, warn};

pub const SEQUENCER: &str = "sequencer";

/// Channel every sequencer joins.
pub const SEQUENCER_CHANNEL: &str = "#sequencer";

const STEP_TAG: &str = "step";

pub fn sequencer_interface() -> Interface {
    Interface::new(SEQUENCER, &["run", "break"])
}

/// Request in flight and the result it should produce.
#[derive(Debug, Clone)]
struct Pending {
    request: String,
    expected: Value,
}

pub struct Sequencer {
    /// Channel requests go to; `None` means the parent's personal channel
    target: Option<String>,

    /// Runs of a `run` without argument
    pub runs: u64,

    /// Seed of the stimulus; the session seed if absent
    seed: Option<u64>,

    /// Operands are drawn from `-max_operand..=max_operand`
    max_operand: i64,

    rng: ChaCha8Rng,
    caller: Option<TalkContext>,
    pending: Option<Pending>,

    /// Runs asked for by the current `run`
    target_runs: u64,
    pub remaining: u64,
    pub complete: u64,
    pub mismatches: u64,
}

impl Sequencer {
    pub fn new(runs: u64) -> Self {
        Self {
            target: None,
            runs,
            seed: None,
            max_operand: 100,
            rng: ChaCha8Rng::seed_from_u64(0),
            caller: None,
            pending: None,
            target_runs: 0,
            remaining: 0,
            complete: 0,
            mismatches: 0,
        }
    }

    pub fn with_target(mut self, channel: impl Into<String>) -> Self {
        self.target = Some(channel.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_operand(mut self, max: i64) -> Self {
        self.max_operand = max.max(1);
        self
    }

    pub fn is_sequencing(&self) -> bool {
        self.caller.is_some()
    }

    /// Draws the next operation and its operands.
    fn draw(&mut self) -> (ArithOp, Value, Value) {
        let ops = ArithOp::all();
        let op = ops[self.rng.gen_range(0..ops.len())];
        let m = self.max_operand;
        let (a, b) = match op {
            ArithOp::Power => (self.rng.gen_range(-9..=9), self.rng.gen_range(0..=6)),
            _ => (self.rng.gen_range(-m..=m), self.rng.gen_range(-m..=m)),
        };
        (op, Value::from(a), Value::from(b))
    }

    fn issue_next(&mut self, cx: &mut WorkerCx<'_>) -> anyhow::Result<()> {
        let (op, a, b) = self.draw();
        let expected = op.apply(&a, &b)?;
        let request = op.request_line(&a, &b);
        let message = Message::call(ARITH, op.method()).with_arg(a).with_arg(b);
        let mut options = RequestOptions::tagged(STEP_TAG);
        if let Some(target) = &self.target {
            options = options.on_channel(target.clone());
        }
        cx.request(message, options)?;
        debug!("{} issued {}", cx.name(), request);
        self.pending = Some(Pending { request, expected });
        Ok(())
    }

    fn summary(&self) -> Outcome {
        let mut fields = Kwargs::new();
        fields.insert("breaked".into(), Value::Bool(self.target_runs != self.complete));
        fields.insert("runs_completed".into(), Value::from(self.complete));
        fields.insert("mismatches".into(), Value::from(self.mismatches));
        Outcome::success_fields(fields)
    }

    fn finish(&mut self, cx: &mut WorkerCx<'_>) {
        if let Some(caller) = self.caller.take() {
            info!(
                "{}: sequence done, {} runs, {} mismatches",
                cx.name(),
                self.complete,
                self.mismatches
            );
            let outcome = self.summary();
            cx.reply(&caller, outcome);
        }
    }
}

impl Worker for Sequencer {
    fn start(&mut self, cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed.unwrap_or_else(|| cx.seed()));
        Ok(Outcome::success(Value::Null))
    }

    fn stop(&mut self, cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
        self.remaining = 0;
        self.pending = None;
        if let Some(caller) = self.caller.take() {
            cx.reply(&caller, Outcome::failure("Sequence interrupted by stop"));
        }
        Ok(Outcome::success(Value::Null))
    }

    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "runs" => Some(Value::from(self.runs)),
            "remaining" => Some(Value::from(self.remaining)),
            "complete" => Some(Value::from(self.complete)),
            "mismatches" => Some(Value::from(self.mismatches)),
            _ => None,
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> Option<anyhow::Result<Value>> {
        (name == "runs").then(|| -> anyhow::Result<Value> {
            self.runs = serde_json::from_value(value.clone())?;
            Ok(value)
        })
    }

    fn on_reply(&mut self, tag: &str, end: RequestEnd, cx: &mut WorkerCx<'_>) -> anyhow::Result<()> {
        if tag != STEP_TAG {
            return Ok(());
        }
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.complete += 1;
        self.remaining = self.remaining.saturating_sub(1);
        let got = end
            .message
            .as_ref()
            .filter(|_| end.success)
            .and_then(|m| m.value("value").cloned());
        if got.as_ref() != Some(&pending.expected) {
            self.mismatches += 1;
            warn!(
                "{}: {} answered {:?}, expected {}",
                cx.name(),
                pending.request,
                end.message.as_ref().map(Message::summary),
                pending.expected
            );
        }
        if self.remaining > 0 && self.caller.is_some() {
            if let Err(e) = self.issue_next(cx) {
                self.remaining = 0;
                self.finish(cx);
                return Err(e);
            }
        } else {
            self.finish(cx);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn run(w: &mut Sequencer, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    if w.is_sequencing() {
        return Ok(Outcome::failure("Already running").into());
    }
    let runs = call.opt_arg::<u64>(0)?.unwrap_or(w.runs);
    w.complete = 0;
    w.mismatches = 0;
    w.target_runs = runs;
    w.remaining = runs;
    if runs == 0 {
        return Ok(w.summary().into());
    }
    call.notify("started sequence");
    w.issue_next(call.cx)?;
    w.caller = Some(call.context.clone());
    Ok(Completion::Deferred)
}

fn do_break(w: &mut Sequencer, _call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.remaining = 0;
    Ok(Outcome::success_named(
        "Breaked sequence. After last issued request is complete sequencer would stop",
        "state",
    )
    .into())
}

pub fn sequencer_protocol() -> Result<Box<dyn Protocol>, platformix_core::BusError> {
    Ok(MethodTable::<Sequencer>::build(sequencer_interface(), &[("run", run), ("break", do_break)])?.boxed())
}

/// Kwargs: `runs`, `channel` (request target), `seed`, `max_operand`.
pub fn construct(blueprint: &Blueprint<'_>) -> Result<Parts, FactoryError> {
    let mut sequencer = Sequencer::new(blueprint.kwarg::<u64>("runs")?.unwrap_or(0));
    if let Some(channel) = blueprint.kwarg::<String>("channel")? {
        sequencer = sequencer.with_target(channel);
    }
    if let Some(seed) = blueprint.kwarg::<u64>("seed")? {
        sequencer = sequencer.with_seed(seed);
    }
    if let Some(max) = blueprint.kwarg::<i64>("max_operand")? {
        sequencer = sequencer.with_max_operand(max);
    }
    Ok(Parts::new(Box::new(sequencer))
        .with_protocol(sequencer_protocol()?)
        .subscribe(SEQUENCER_CHANNEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::calc::{arith_protocol, Calc};
    use platformix_core::{Component, ComponentSpec, Farm, FarmConfig, ReplyRouting, Replies};
    use platformix_core::{PLATFORMIX, PLATFORMS_CHANNEL};
    use platformix_env::ManualContext;
    use serde_json::json;

    fn farm(sequencer: Sequencer, calc: Calc) -> Farm {
        let mut farm = Farm::new(FarmConfig::default(), ManualContext::shared(5));
        let c = Component::new(
            ComponentSpec::new("calc", "calc"),
            Box::new(calc),
            vec![arith_protocol().unwrap()],
            farm.config(),
        )
        .unwrap();
        farm.register(c).unwrap();
        let s = Component::new(
            ComponentSpec::new("seq", SEQUENCER).with_parent("calc").subscribe(SEQUENCER_CHANNEL),
            Box::new(sequencer),
            vec![sequencer_protocol().unwrap()],
            farm.config(),
        )
        .unwrap();
        farm.register(s).unwrap();
        farm
    }

    fn transact(farm: &mut Farm, channel: &str, message: Message) -> Replies {
        let ctx = farm
            .start_conversation(channel, &message.interface.clone(), ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, message, None).unwrap().unwrap()
    }

    fn started(sequencer: Sequencer, calc: Calc) -> Farm {
        let mut f = farm(sequencer, calc);
        let r = transact(&mut f, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        assert!(r.values().all(Message::is_success));
        f
    }

    #[test]
    fn test_run_against_mock() {
        let mut f = started(Sequencer::new(10), Calc::mock());
        let r = transact(&mut f, SEQUENCER_CHANNEL, Message::call(SEQUENCER, "run"));
        let reply = &r["seq"];
        assert!(reply.is_success());
        assert_eq!(reply.value("runs_completed"), Some(&json!(10)));
        assert_eq!(reply.value("mismatches"), Some(&json!(0)));
        assert_eq!(reply.value("breaked"), Some(&json!(false)));
        assert_eq!(f.component("calc").unwrap().worker::<Calc>().unwrap().calls, 10);
    }

    #[test]
    fn test_run_against_link() {
        let calc = Calc::linked(Box::new(crate::arith::calculator_link("app")));
        let mut f = started(Sequencer::new(5).with_seed(99), calc);
        let r = transact(&mut f, SEQUENCER_CHANNEL, Message::call(SEQUENCER, "run").with_arg(7));
        assert_eq!(r["seq"].value("runs_completed"), Some(&json!(7)));
        assert_eq!(r["seq"].value("mismatches"), Some(&json!(0)));
    }

    #[test]
    fn test_zero_runs() {
        let mut f = started(Sequencer::new(0), Calc::mock());
        let r = transact(&mut f, "@seq", Message::call(SEQUENCER, "run"));
        assert_eq!(r["seq"].value("runs_completed"), Some(&json!(0)));
    }

    #[test]
    fn test_break_when_idle() {
        let mut f = started(Sequencer::new(3), Calc::mock());
        let r = transact(&mut f, "@seq", Message::call(SEQUENCER, "break"));
        assert!(r["seq"].is_success());
        assert!(r["seq"].value("state").is_some());
    }

    #[test]
    fn test_requires_running() {
        let mut f = farm(Sequencer::new(3), Calc::mock());
        let r = transact(&mut f, SEQUENCER_CHANNEL, Message::call(SEQUENCER, "run"));
        assert!(r["seq"].is_failure());
    }

    #[test]
    fn test_same_seed_same_stimulus() {
        let mut a = Sequencer::new(0).with_seed(3);
        let mut b = Sequencer::new(0).with_seed(3);
        a.rng = ChaCha8Rng::seed_from_u64(3);
        b.rng = ChaCha8Rng::seed_from_u64(3);
        let da: Vec<_> = (0..20).map(|_| a.draw()).collect();
        let db: Vec<_> = (0..20).map(|_| b.draw()).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn test_set_runs_property() {
        let mut s = Sequencer::new(1);
        assert!(s.set_property("runs", json!(4)).unwrap().is_ok());
        assert_eq!(s.runs, 4);
        assert!(s.set_property("runs", json!("many")).unwrap().is_err());
        assert!(s.set_property("speed", json!(1)).is_none());
    }
}
