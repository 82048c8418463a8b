//! The platformix lifecycle protocol every component hosts.
//!
//! # State machine
//!
//! ```text
//!             start                      all wait-list peers running
//!   Stopped ────────► StartWaiting ─────────────────────────────► Starting
//!      ▲                  │  peer failed / wait timeout               │ worker.start
//!      │                  ▼                                           ▼
//!      │            (failure to every                             Running
//!      │             start requester)                                │ stop
//!      │                                                             ▼
//!   Stopping ◄──────── children/dependents stopped ◄──────── StopWaiting
//!   worker.stop          (failed or timed-out ones are ignored)
//! ```
//!
//! Concurrent requests for the same action join it: their contexts are
//! added to the action's reply-to list and all of them get the single
//! terminal result. A stop arriving during a start interrupts it.

use crate::component::{entry_generation, register_faults, Bus, Component};
use crate::context::TalkContext;
use crate::error::BusError;
use crate::fault::{FaultDecision, ReplyOverride};
use crate::interface::{decode_arg, Interface};
use crate::message::{Kwargs, Message, Outcome, ERRCODE_EXCEPTION, TESTING_METHOD};
use crate::registry::{HandlerKind, RegistryEntry};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interface id of the lifecycle protocol.
pub const PLATFORMIX: &str = "platformix";

/// Method vocabulary of the lifecycle protocol.
pub fn platformix_interface() -> Interface {
    Interface::new(PLATFORMIX, &["start", "stop", "get", "set", "call", "report"])
}

/// Raw lifecycle flags of a component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleFlags {
    pub running: bool,
    pub starting: bool,
    pub start_in_progress: bool,
    pub stopping: bool,
    pub stop_in_progress: bool,
}

/// Named state derived from the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    StartWaiting,
    Starting,
    Running,
    StopWaiting,
    Stopping,
}

impl LifecycleFlags {
    pub fn state(&self) -> LifecycleState {
        match self {
            LifecycleFlags { stop_in_progress: true, .. } => LifecycleState::Stopping,
            LifecycleFlags { stopping: true, .. } => LifecycleState::StopWaiting,
            LifecycleFlags { start_in_progress: true, .. } => LifecycleState::Starting,
            LifecycleFlags { starting: true, .. } => LifecycleState::StartWaiting,
            LifecycleFlags { running: true, .. } => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::StartWaiting => "start_waiting",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::StopWaiting => "stop_waiting",
            LifecycleState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
}

/// Bookkeeping of the action in progress.
#[derive(Debug, Clone)]
pub(crate) struct ActionContext {
    pub(crate) action: Action,

    /// Every context waiting for the terminal result
    pub(crate) reply_to: Vec<TalkContext>,

    /// Peers the action currently waits for
    pub(crate) waiting_for: Vec<String>,

    /// Peers a stop gave up on
    pub(crate) wait_ignore: Vec<String>,

    /// Distinguishes this action's wait handlers from stale ones
    pub(crate) generation: u64,
}

impl ActionContext {
    fn new(action: Action, context: &TalkContext, generation: u64) -> Self {
        Self {
            action,
            reply_to: vec![context.clone()],
            waiting_for: Vec::new(),
            wait_ignore: Vec::new(),
            generation,
        }
    }
}

fn wait_entry(kind: HandlerKind, generation: u64, now: Duration, limit: Duration) -> RegistryEntry {
    let mut kwargs = Kwargs::new();
    kwargs.insert("generation".into(), Value::from(generation));
    RegistryEntry::new(kind)
        .with_timeout(now, Some(limit))
        .with_args(Vec::new(), kwargs)
}

fn status(key: &str, value: Value) -> Kwargs {
    let mut state = Kwargs::new();
    state.insert(key.into(), value);
    state
}

impl Component {
    /// Entry point for calls on the lifecycle interface.
    ///
    /// # Errors
    /// An execute-mode fault rule on `start` or `stop`; those replies go to
    /// several requesters at once and can't be overridden per call.
    pub(crate) fn dispatch_lifecycle(
        &mut self,
        context: &TalkContext,
        message: &Message,
        decision: FaultDecision,
        bus: &mut Bus<'_>,
    ) -> Result<(), BusError> {
        let override_ = match decision {
            FaultDecision::Replace(outcome) => {
                self.reply(bus, context, outcome);
                return Ok(());
            }
            FaultDecision::Override(ov) => {
                if message.method == "start" || message.method == "stop" {
                    return Err(BusError::violation(format!(
                        "{}: {} replies of {} can't be overridden in execute mode",
                        self.name(),
                        PLATFORMIX,
                        message.method
                    )));
                }
                ov
            }
            FaultDecision::Proceed => ReplyOverride::default(),
        };

        let result = match message.method.as_str() {
            TESTING_METHOD => {
                let outcome = register_faults(&mut self.lifecycle_faults, context, message)?;
                self.reply(bus, context, outcome);
                return Ok(());
            }
            "start" => return self.start(context, bus),
            "stop" => return self.stop(context, bus),
            "get" => self.get(message),
            "set" => self.set(message),
            "call" => self.call(message),
            "report" => self.report(message),
            other => Ok(Outcome::failure(format!("Method {} not found on {}", other, self.name()))),
        };
        let outcome = result.unwrap_or_else(|e| {
            error!("{}: {} raised: {:#}", self.name(), message.summary(), e);
            Outcome::exception(&message.method, &e)
        });
        self.reply(bus, context, override_.apply(outcome));
        Ok(())
    }

    fn start(&mut self, context: &TalkContext, bus: &mut Bus<'_>) -> Result<(), BusError> {
        if self.flags.running {
            self.reply(bus, context, Outcome::success_named("already running", "state"));
            return Ok(());
        }
        if self.flags.stopping {
            self.reply(bus, context, Outcome::failure("stop is in progress"));
            return Ok(());
        }
        let fresh = if self.flags.starting {
            match self.action.as_mut() {
                Some(a) if a.action == Action::Start && !a.reply_to.contains(context) => {
                    a.reply_to.push(context.clone());
                    true
                }
                _ => false,
            }
        } else {
            self.flags.starting = true;
            self.failed_start.clear();
            self.generation += 1;
            self.action = Some(ActionContext::new(Action::Start, context, self.generation));
            self.notify(bus, context, "received start signal");
            true
        };
        self.resume_start(fresh.then_some(context), bus)
    }

    /// Re-evaluates a pending start; `joined` is a context that just joined it.
    fn resume_start(&mut self, joined: Option<&TalkContext>, bus: &mut Bus<'_>) -> Result<(), BusError> {
        if !self.flags.starting {
            return Ok(());
        }
        let waiting_for: Vec<String> = self
            .wait_list()
            .into_iter()
            .filter(|w| !bus.peers.get(w).map_or(false, |p| p.flags.running))
            .collect();
        let Some(action) = self.action.as_mut().filter(|a| a.action == Action::Start) else {
            return Ok(());
        };
        action.waiting_for = waiting_for.clone();
        let generation = action.generation;
        let reply_to = action.reply_to.clone();

        // a peer that already failed on one of our contexts replied before we listened
        let failed = waiting_for.iter().find(|w| {
            bus.peers.get(*w).map_or(false, |p| {
                !p.flags.starting && p.failed_start.iter().any(|c| reply_to.contains(c))
            })
        });
        if let Some(peer) = failed.cloned() {
            return self.abort_start(Some(peer), bus);
        }

        if !waiting_for.is_empty() {
            if let Some(context) = joined {
                let entry = wait_entry(HandlerKind::StartWait, generation, bus.clock.now(), self.start_max_wait);
                self.endpoint.registry.register(context.clone(), entry, true)?;
                self.notify(bus, context, "waiting");
                debug!("{} waits for {:?} to start", self.name(), waiting_for);
            }
            return Ok(());
        }
        if self.flags.start_in_progress {
            return Ok(());
        }

        for c in &reply_to {
            self.endpoint.registry.unregister(c, true, Kwargs::new(), true)?;
        }
        self.flags.start_in_progress = true;
        self.notify_all(bus, &reply_to, "launching");
        let result = {
            let mut cx = self.endpoint.cx(bus);
            self.worker.start(&mut cx)
        };
        let outcome = result.unwrap_or_else(|e| {
            error!("{}: start raised: {:#}", self.name(), e);
            Outcome::exception("start", &e)
        });
        self.action = None;
        self.flags.starting = false;
        self.flags.start_in_progress = false;
        self.flags.running = outcome.is_success();
        self.failed_start = if self.flags.running { Vec::new() } else { reply_to.clone() };
        if self.flags.running {
            info!("{} just started", self.name());
        } else {
            warn!("{} failed to start", self.name());
        }
        self.reply_all(bus, &reply_to, &outcome);
        Ok(())
    }

    /// Wait handler of a pending start; `message` is `None` on timeout.
    pub(crate) fn on_start_reply(
        &mut self,
        context: &TalkContext,
        entry: &RegistryEntry,
        message: Option<&Message>,
        bus: &mut Bus<'_>,
    ) -> Result<(), BusError> {
        let current = self
            .action
            .as_ref()
            .map_or(false, |a| a.action == Action::Start && entry_generation(entry) == Some(a.generation));
        if !current {
            self.endpoint.registry.unregister(context, false, Kwargs::new(), true)?;
            return Ok(());
        }
        if let Some(m) = message {
            if !self.expects_from(Action::Start, entry, m) {
                return Ok(());
            }
        }
        if let Some(m) = message {
            if m.is_success() {
                return self.resume_start(None, bus);
            }
        }
        self.abort_start(message.and_then(|m| m.sender.clone()), bus)
    }

    /// Answers a pending start with a failure; `failed` is the peer that
    /// failed to start, `None` when the wait timed out.
    fn abort_start(&mut self, failed: Option<String>, bus: &mut Bus<'_>) -> Result<(), BusError> {
        let Some(action) = self.action.take() else {
            return Ok(());
        };
        self.flags.starting = false;
        self.flags.start_in_progress = false;
        self.failed_start = action.reply_to.clone();
        let (state, outcome) = match failed {
            Some(sender) => (
                status("dependency failed to start", Value::String(sender.clone())),
                Outcome::failure(format!("Aborting start due to platform {} failed to start", sender)),
            ),
            None => (
                status("__timeouted__", Value::Bool(true)),
                Outcome::failure(format!(
                    "Aborting start due to wait timeout. Platforms {:?} have not started within timeout {:?}",
                    action.waiting_for, self.start_max_wait
                )),
            ),
        };
        for c in &action.reply_to {
            self.endpoint.registry.unregister(c, false, state.clone(), true)?;
        }
        warn!("{}: start aborted", self.name());
        self.reply_all(bus, &action.reply_to, &outcome);
        Ok(())
    }

    fn stop(&mut self, context: &TalkContext, bus: &mut Bus<'_>) -> Result<(), BusError> {
        let was_stopping = self.flags.stopping;
        let need_stop = self.flags.running || self.flags.starting;
        self.flags.stopping = true;

        if !was_stopping {
            if let Some(interrupted) = self.action.take() {
                for c in &interrupted.reply_to {
                    self.endpoint.registry.unregister(c, false, Kwargs::new(), true)?;
                }
                self.flags.starting = false;
                self.flags.start_in_progress = false;
                if interrupted.action == Action::Start {
                    self.failed_start = interrupted.reply_to.clone();
                }
                self.reply_all(bus, &interrupted.reply_to, &Outcome::failure("interrupted by stop"));
            }
        }
        if !was_stopping && !need_stop {
            self.flags.stopping = false;
            self.reply(bus, context, Outcome::success_named("already stopped", "state"));
            return Ok(());
        }

        let fresh = if was_stopping {
            match self.action.as_mut() {
                Some(a) if a.action == Action::Stop && !a.reply_to.contains(context) => {
                    a.reply_to.push(context.clone());
                    true
                }
                _ => false,
            }
        } else {
            self.generation += 1;
            self.action = Some(ActionContext::new(Action::Stop, context, self.generation));
            self.notify(bus, context, "received stop signal");
            true
        };
        self.resume_stop(fresh.then_some(context), bus)
    }

    /// Re-evaluates a pending stop; `joined` is a context that just joined it.
    fn resume_stop(&mut self, joined: Option<&TalkContext>, bus: &mut Bus<'_>) -> Result<(), BusError> {
        let Some(action) = self.action.as_ref().filter(|a| a.action == Action::Stop) else {
            return Ok(());
        };
        let mut waiting_for: Vec<String> = Vec::new();
        for peer in self.subplatforms.iter().chain(self.depended.iter()) {
            let busy = bus.peers.get(peer).map_or(false, |p| p.flags.running || p.flags.stopping);
            if busy && !action.wait_ignore.contains(peer) && !waiting_for.contains(peer) {
                waiting_for.push(peer.clone());
            }
        }
        let generation = action.generation;
        let reply_to = action.reply_to.clone();
        if let Some(a) = self.action.as_mut() {
            a.waiting_for = waiting_for.clone();
        }

        if !waiting_for.is_empty() {
            if let Some(context) = joined {
                let entry = wait_entry(HandlerKind::StopWait, generation, bus.clock.now(), self.stop_max_wait);
                self.endpoint.registry.register(context.clone(), entry, true)?;
                self.notify(bus, context, "waiting");
                debug!("{} waits for {:?} to stop", self.name(), waiting_for);
            }
            return Ok(());
        }
        if self.flags.stop_in_progress {
            return Ok(());
        }

        for c in &reply_to {
            self.endpoint.registry.unregister(c, true, Kwargs::new(), true)?;
        }
        self.flags.running = false;
        self.flags.stop_in_progress = true;
        self.notify_all(bus, &reply_to, "stopping");
        let result = {
            let mut cx = self.endpoint.cx(bus);
            self.worker.stop(&mut cx)
        };
        let outcome = match result {
            Ok(o) if o.is_success() => Outcome::success(Value::Null),
            Ok(o) => o,
            Err(e) => {
                error!("{}: stop raised: {:#}", self.name(), e);
                Outcome::exception("stop", &e)
            }
        };
        self.action = None;
        self.flags.stopping = false;
        self.flags.stop_in_progress = false;
        info!("{} stopped", self.name());
        self.reply_all(bus, &reply_to, &outcome);
        Ok(())
    }

    /// Wait handler of a pending stop; `message` is `None` on timeout.
    pub(crate) fn on_stop_reply(
        &mut self,
        context: &TalkContext,
        entry: &RegistryEntry,
        message: Option<&Message>,
        bus: &mut Bus<'_>,
    ) -> Result<(), BusError> {
        let current = self
            .action
            .as_ref()
            .map_or(false, |a| a.action == Action::Stop && entry_generation(entry) == Some(a.generation));
        if !current {
            self.endpoint.registry.unregister(context, false, Kwargs::new(), true)?;
            return Ok(());
        }
        if let Some(m) = message {
            if !self.expects_from(Action::Stop, entry, m) {
                return Ok(());
            }
        }
        let stop_max_wait = self.stop_max_wait;
        let Some(action) = self.action.as_mut() else {
            return Ok(());
        };
        let note = match message {
            None => {
                let late = action.waiting_for.clone();
                action.wait_ignore.extend(late.iter().cloned());
                Some(format!(
                    "Subplatforms {:?} have not stopped within timeout {:?}. Ignoring them (may cause exception later)",
                    late, stop_max_wait
                ))
            }
            Some(m) if m.is_failure() => {
                let sender = m.sender.clone().unwrap_or_default();
                action.wait_ignore.push(sender.clone());
                Some(format!(
                    "Subplatform {} failed to stop, ignoring it (but it may cause exception later)",
                    sender
                ))
            }
            Some(_) => None,
        };
        if let Some(note) = note {
            let reply_to = action.reply_to.clone();
            warn!("{}: {}", self.name(), note);
            self.notify_all(bus, &reply_to, &note);
        }
        self.resume_stop(None, bus)
    }

    /// Stops the worker unconditionally and resets the lifecycle.
    ///
    /// Used by emergency stop; pending requesters get no reply.
    pub(crate) fn force_stop(&mut self, bus: &mut Bus<'_>) -> anyhow::Result<Outcome> {
        if let Some(action) = self.action.take() {
            for c in &action.reply_to {
                self.endpoint.registry.discard(c);
            }
        }
        let result = {
            let mut cx = self.endpoint.cx(bus);
            self.worker.stop(&mut cx)
        };
        self.flags = LifecycleFlags::default();
        result
    }

    fn builtin_property(&self, name: &str) -> Option<Value> {
        let value = match name {
            "name" => json!(self.name()),
            "kind" => json!(self.kind()),
            "parent" => json!(self.parent()),
            "wait" => json!(self.wait()),
            "running" => json!(self.flags.running),
            "state" => json!(self.flags.state()),
            "start_max_wait" => json!(self.start_max_wait.as_secs_f64()),
            "stop_max_wait" => json!(self.stop_max_wait.as_secs_f64()),
            _ => return None,
        };
        Some(value)
    }

    fn set_builtin(&mut self, name: &str, value: &Value) -> Option<anyhow::Result<Value>> {
        let slot = match name {
            "start_max_wait" => &mut self.start_max_wait,
            "stop_max_wait" => &mut self.stop_max_wait,
            _ => return None,
        };
        let result = value
            .as_f64()
            .filter(|s| *s >= 0.0)
            .map(|s| {
                *slot = Duration::from_secs_f64(s);
                value.clone()
            })
            .ok_or_else(|| anyhow::anyhow!("{} must be a non-negative number of seconds", name));
        Some(result)
    }

    fn get(&self, message: &Message) -> anyhow::Result<Outcome> {
        let prop: String = decode_arg(message, 0)?;
        let value = self.worker.property(&prop).or_else(|| self.builtin_property(&prop));
        Ok(match value {
            Some(v) => Outcome::success_named(v, &prop),
            None => Outcome::failure(format!("Property {} not found on {}", prop, self.name())),
        })
    }

    fn set(&mut self, message: &Message) -> anyhow::Result<Outcome> {
        let prop: String = decode_arg(message, 0)?;
        let value: Value = decode_arg(message, 1)?;
        let result = match self.worker.set_property(&prop, value.clone()) {
            Some(r) => Some(r),
            None => self.set_builtin(&prop, &value),
        };
        Ok(match result {
            Some(Ok(v)) => Outcome::success_named(v, &prop),
            Some(Err(e)) => Outcome::failure(format!(
                "Failed to set attribute {} of {} to value {} due to exception {:#}",
                prop,
                self.name(),
                value,
                e
            )),
            None => Outcome::failure(format!("Property {} not found on {}", prop, self.name())),
        })
    }

    fn call(&mut self, message: &Message) -> anyhow::Result<Outcome> {
        let method: String = decode_arg(message, 0)?;
        let args = &message.args[1..];
        Ok(match self.worker.invoke(&method, args) {
            Some(Ok(v)) => Outcome::success(v),
            Some(Err(e)) => Outcome::failure_code(
                format!(
                    "Failed to call method {} of {} with args {} due to exception {:#}",
                    method,
                    self.name(),
                    Value::Array(args.to_vec()),
                    e
                ),
                ERRCODE_EXCEPTION,
            ),
            None => Outcome::failure(format!("Method {} not found on {}", method, self.name())),
        })
    }

    fn report(&self, message: &Message) -> anyhow::Result<Outcome> {
        let what: String = decode_arg(message, 0)?;
        let running = if self.flags.running { "True" } else { "False" };
        Ok(match what.as_str() {
            "running" => Outcome::success(running),
            "is_running" if self.flags.running => Outcome::success_named(running, "state"),
            "is_running" => Outcome::failure(running),
            other => Outcome::failure(format!("Unknown report request {}", other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_flags() {
        let mut f = LifecycleFlags::default();
        assert_eq!(f.state(), LifecycleState::Stopped);
        f.starting = true;
        assert_eq!(f.state(), LifecycleState::StartWaiting);
        f.start_in_progress = true;
        assert_eq!(f.state(), LifecycleState::Starting);
        f = LifecycleFlags {
            running: true,
            ..Default::default()
        };
        assert_eq!(f.state(), LifecycleState::Running);
        f.stopping = true;
        assert_eq!(f.state(), LifecycleState::StopWaiting);
        f.stop_in_progress = true;
        assert_eq!(f.state(), LifecycleState::Stopping);
        assert_eq!(f.state().to_string(), "stopping");
    }

    #[test]
    fn test_interface_methods() {
        let i = platformix_interface();
        for m in ["start", "stop", "get", "set", "call", "report"] {
            assert!(i.declares(m));
        }
        assert!(i.supports(&Message::call(PLATFORMIX, TESTING_METHOD)));
        assert!(!i.supports(&Message::call(PLATFORMIX, "restart")));
    }
}
