//! Component (platform): one addressable participant of the bus.
//!
//! A component owns its reply registry, its receive/processing queues, the
//! fault queues of the protocols it hosts, and the worker that implements
//! its behaviour. The Farm drives it in two steps:
//!
//! ```text
//!   Channel ──receive()──► received ──queue_received()──► queued
//!                                                            │
//!                               process_queued(bus) ◄────────┘
//!                                 │
//!                 ┌───────────────┼──────────────────┐
//!                 ▼               ▼                  ▼
//!          reply handler    platformix lifecycle   hosted protocol
//!          (registry)       (start/stop/get/...)   (fault check, running
//!                                                   guard, method table)
//! ```
//!
//! Nothing is sent directly: replies go to the bus outbox and the Farm
//! delivers them once processing of this component returns.

use crate::channel::{ChannelTable, Envelope};
use crate::config::FarmConfig;
use crate::context::TalkContext;
use crate::error::BusError;
use crate::fault::{FaultDecision, FaultQueue, FaultRule, ReplyOverride};
use crate::interface::{Call, Completion, Interface, Protocol};
use crate::lifecycle::{platformix_interface, Action, ActionContext, LifecycleFlags, PLATFORMIX};
use crate::mailbox::Mailbox;
use crate::message::{Kwargs, Message, Outcome, TESTING_METHOD};
use crate::registry::{HandlerKind, RegistryEntry, ReplyRegistry};
use crate::worker::{stamp, RequestEnd, Worker, WorkerCx};
use platformix_env::BusContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Channel every component listens on for lifecycle broadcasts.
pub const PLATFORMS_CHANNEL: &str = "#platforms";

/// Personal channel of a component.
pub fn personal_channel(name: &str) -> String {
    format!("@{}", name)
}

/// Construction parameters of a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,

    /// Factory kind the component was built from
    pub kind: String,

    /// Hosting component; implicitly part of the wait-list
    pub parent: Option<String>,

    /// Components that must be running before this one starts
    pub wait: Vec<String>,

    /// Per-component start wait limit; the Farm default if absent
    pub start_max_wait: Option<Duration>,

    /// Per-component stop wait limit; the Farm default if absent
    pub stop_max_wait: Option<Duration>,

    /// Channels to join besides the personal one and `#platforms`
    pub subscriptions: Vec<String>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_wait<I, S>(mut self, wait: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait = wait.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_start_max_wait(mut self, limit: Duration) -> Self {
        self.start_max_wait = Some(limit);
        self
    }

    pub fn with_stop_max_wait(mut self, limit: Duration) -> Self {
        self.stop_max_wait = Some(limit);
        self
    }

    pub fn subscribe(mut self, channel: impl Into<String>) -> Self {
        self.subscriptions.push(channel.into());
        self
    }
}

/// A protocol hosted by a component with its fault queue.
pub(crate) struct ProtocolSlot {
    pub(crate) protocol: Box<dyn Protocol>,
    pub(crate) faults: FaultQueue,
}

/// Lifecycle of another component as seen while processing.
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerState {
    pub(crate) flags: LifecycleFlags,

    /// Contexts its last start attempt was answered with a failure on
    pub(crate) failed_start: Vec<TalkContext>,
}

/// Lifecycle view of other components, snapshotted before each processing step.
pub(crate) type PeerView = HashMap<String, PeerState>;

/// Farm-owned resources a component uses while processing.
pub(crate) struct Bus<'a> {
    pub(crate) channels: &'a mut ChannelTable,
    pub(crate) outbox: &'a mut Vec<Envelope>,
    pub(crate) clock: &'a dyn BusContext,
    pub(crate) config: &'a FarmConfig,
    pub(crate) peers: &'a PeerView,
}

/// The part of a component a worker may touch through [`WorkerCx`].
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) registry: ReplyRegistry,
    pub(crate) mailbox: Mailbox,
}

impl Endpoint {
    pub(crate) fn cx<'s>(&'s mut self, bus: &'s mut Bus<'_>) -> WorkerCx<'s> {
        WorkerCx {
            name: &self.name,
            parent: self.parent.as_deref(),
            registry: &mut self.registry,
            mailbox: &self.mailbox,
            channels: &mut *bus.channels,
            outbox: &mut *bus.outbox,
            clock: bus.clock,
            config: bus.config,
        }
    }
}

/// One addressable participant of the bus.
pub struct Component {
    pub(crate) endpoint: Endpoint,
    kind: String,

    /// Explicit wait-list (the parent is added by `wait_list`)
    wait: Vec<String>,
    pub(crate) subplatforms: Vec<String>,
    pub(crate) depended: Vec<String>,
    subscriptions: Vec<String>,

    pub(crate) flags: LifecycleFlags,
    pub(crate) failed_start: Vec<TalkContext>,
    pub(crate) action: Option<ActionContext>,
    pub(crate) generation: u64,
    pub(crate) start_max_wait: Duration,
    pub(crate) stop_max_wait: Duration,

    received: Vec<Envelope>,
    queued: VecDeque<Envelope>,

    lifecycle: Interface,
    pub(crate) lifecycle_faults: FaultQueue,
    pub(crate) protocols: Vec<ProtocolSlot>,
    pub(crate) worker: Box<dyn Worker>,
}

impl Component {
    /// Builds a component around `worker`, hosting `protocols`.
    ///
    /// # Errors
    /// A wait-list naming the component itself, a protocol whose method
    /// table is bound to another worker type, or two protocols (or a
    /// protocol and the lifecycle protocol) with the same interface id.
    pub fn new(
        spec: ComponentSpec,
        worker: Box<dyn Worker>,
        protocols: Vec<Box<dyn Protocol>>,
        config: &FarmConfig,
    ) -> Result<Self, BusError> {
        if spec.wait.iter().any(|w| *w == spec.name) || spec.parent.as_deref() == Some(spec.name.as_str()) {
            return Err(BusError::SelfWait(spec.name));
        }
        let lifecycle = platformix_interface();
        let mut ids = vec![lifecycle.id().to_string()];
        for p in &protocols {
            if !p.accepts_worker(worker.as_ref()) {
                return Err(BusError::violation(format!(
                    "protocol {} can't drive the worker of {}",
                    p.interface().id(),
                    spec.name
                )));
            }
            if ids.iter().any(|i| i == p.interface().id()) {
                return Err(BusError::violation(format!(
                    "protocol {} is already supported by {}",
                    p.interface().id(),
                    spec.name
                )));
            }
            ids.push(p.interface().id().to_string());
        }

        let mut subscriptions = vec![personal_channel(&spec.name), PLATFORMS_CHANNEL.to_string()];
        for s in spec.subscriptions {
            if !subscriptions.contains(&s) {
                subscriptions.push(s);
            }
        }

        Ok(Self {
            endpoint: Endpoint {
                name: spec.name,
                parent: spec.parent,
                registry: ReplyRegistry::new(),
                mailbox: Mailbox::new(),
            },
            kind: spec.kind,
            wait: spec.wait,
            subplatforms: Vec::new(),
            depended: Vec::new(),
            subscriptions,
            flags: LifecycleFlags::default(),
            failed_start: Vec::new(),
            action: None,
            generation: 0,
            start_max_wait: spec.start_max_wait.unwrap_or(config.start_max_wait),
            stop_max_wait: spec.stop_max_wait.unwrap_or(config.stop_max_wait),
            received: Vec::new(),
            queued: VecDeque::new(),
            lifecycle,
            lifecycle_faults: FaultQueue::new(),
            protocols: protocols
                .into_iter()
                .map(|protocol| ProtocolSlot {
                    protocol,
                    faults: FaultQueue::new(),
                })
                .collect(),
            worker,
        })
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn parent(&self) -> Option<&str> {
        self.endpoint.parent.as_deref()
    }

    /// Explicit wait-list, without the parent.
    pub fn wait(&self) -> &[String] {
        &self.wait
    }

    /// Everything that must be running before a start: wait-list plus parent.
    pub fn wait_list(&self) -> Vec<String> {
        let mut all = self.wait.clone();
        if let Some(p) = &self.endpoint.parent {
            if !all.contains(p) {
                all.push(p.clone());
            }
        }
        all
    }

    pub fn subplatforms(&self) -> &[String] {
        &self.subplatforms
    }

    /// Components that named this one in their wait-list.
    pub fn depended(&self) -> &[String] {
        &self.depended
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn flags(&self) -> LifecycleFlags {
        self.flags
    }

    pub(crate) fn peer_state(&self) -> PeerState {
        PeerState {
            flags: self.flags,
            failed_start: self.failed_start.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    pub fn start_max_wait(&self) -> Duration {
        self.start_max_wait
    }

    pub fn stop_max_wait(&self) -> Duration {
        self.stop_max_wait
    }

    /// Lifecycle action in progress, if any.
    pub fn active_action(&self) -> Option<Action> {
        self.action.as_ref().map(|a| a.action)
    }

    /// Peers the active action is waiting for.
    pub fn waiting_for(&self) -> Vec<String> {
        self.action.as_ref().map(|a| a.waiting_for.clone()).unwrap_or_default()
    }

    /// Peers the active stop gave up waiting for.
    pub fn wait_ignore(&self) -> Vec<String> {
        self.action.as_ref().map(|a| a.wait_ignore.clone()).unwrap_or_default()
    }

    pub fn registry(&self) -> &ReplyRegistry {
        &self.endpoint.registry
    }

    /// Takes the parked end state of a request this component issued.
    pub fn pop_request_state(&mut self, context: &TalkContext) -> Option<Kwargs> {
        self.endpoint.registry.pop_end_state(context)
    }

    /// Fault rules still queued for `interface` on `channel`.
    pub fn pending_faults(&self, interface: &str, channel: &str) -> usize {
        if interface == PLATFORMIX {
            return self.lifecycle_faults.pending(channel);
        }
        self.protocols
            .iter()
            .find(|s| s.protocol.interface().id() == interface)
            .map_or(0, |s| s.faults.pending(channel))
    }

    /// The worker as its concrete type.
    pub fn worker<W: Worker>(&self) -> Option<&W> {
        self.worker.as_any().downcast_ref::<W>()
    }

    pub fn worker_mut<W: Worker>(&mut self) -> Option<&mut W> {
        self.worker.as_any_mut().downcast_mut::<W>()
    }

    /// Whether some handler still waits for a reply.
    pub fn waiting_reply(&self) -> bool {
        !self.endpoint.registry.is_empty()
    }

    /// Tickets issued and not answered yet.
    pub fn in_flight(&self) -> usize {
        self.endpoint.mailbox.in_flight()
    }

    /// Messages received and not processed yet.
    pub fn pending_input(&self) -> usize {
        self.received.len() + self.queued.len()
    }

    /// Whether `message` is a call one of the hosted protocols understands.
    pub fn supports(&self, message: &Message) -> bool {
        self.lifecycle.supports(message) || self.protocols.iter().any(|s| s.protocol.interface().supports(message))
    }

    pub(crate) fn add_subscription(&mut self, channel: &str) -> bool {
        if self.subscriptions.iter().any(|s| s == channel) {
            return false;
        }
        self.subscriptions.push(channel.to_string());
        true
    }

    pub(crate) fn remove_subscription(&mut self, channel: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s != channel);
        before != self.subscriptions.len()
    }

    /// Channel receive hook: queues what this component will handle.
    ///
    /// Replies are offered to the registered handler as a dry run; calls
    /// are accepted when a hosted protocol supports them. Whatever is left
    /// goes to the worker's `observe`.
    pub(crate) fn receive(&mut self, context: &TalkContext, message: &Message, now: Duration) -> bool {
        if message.sender.as_deref() == Some(self.name()) {
            return false;
        }
        let accepted = if message.is_reply() {
            match self.endpoint.registry.get(context) {
                Some(entry) if !entry.timed_out(now) => self.accepts_reply(entry, message),
                _ => false,
            }
        } else {
            self.supports(message)
        };
        if accepted {
            self.received.push(Envelope::new(context.clone(), message.clone()));
            return true;
        }
        self.worker.observe(context, message)
    }

    /// Dry run of a reply handler.
    fn accepts_reply(&self, entry: &RegistryEntry, message: &Message) -> bool {
        if !message.is_success() && !message.is_failure() {
            return false;
        }
        match &entry.kind {
            HandlerKind::Request { .. } => true,
            HandlerKind::StartWait => self.expects_from(Action::Start, entry, message),
            HandlerKind::StopWait => self.expects_from(Action::Stop, entry, message),
        }
    }

    /// Whether the live `action` waits for the sender of `message`.
    pub(crate) fn expects_from(&self, action: Action, entry: &RegistryEntry, message: &Message) -> bool {
        let Some(live) = &self.action else {
            return false;
        };
        live.action == action
            && entry_generation(entry) == Some(live.generation)
            && message
                .sender
                .as_ref()
                .map_or(false, |s| live.waiting_for.contains(s))
    }

    /// Moves received messages into the processing queue.
    pub(crate) fn queue_received(&mut self) {
        self.queued.extend(self.received.drain(..));
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Forwards replies posted through tickets into the outbox.
    pub(crate) fn poll_mailbox(&mut self, outbox: &mut Vec<Envelope>) -> usize {
        let posted = self.endpoint.mailbox.drain();
        let n = posted.len();
        for p in posted {
            outbox.push(stamp(&self.endpoint.name, &p.context, p.message));
        }
        n
    }

    /// Processes everything queued.
    pub(crate) fn process_queued(&mut self, bus: &mut Bus<'_>) -> Result<(), BusError> {
        while let Some(Envelope { context, message }) = self.queued.pop_front() {
            if message.is_reply() {
                let Some(entry) = self.endpoint.registry.get(&context).cloned() else {
                    debug!("{}: dropping reply on closed {}", self.name(), context);
                    continue;
                };
                if entry.timed_out(bus.clock.now()) {
                    continue;
                }
                self.run_handler(&context, entry, Some(&message), bus)?;
            } else {
                self.dispatch(&context, &message, bus)?;
            }
        }
        Ok(())
    }

    /// Invokes handlers whose deadline elapsed, once each.
    pub(crate) fn fire_timeouts(&mut self, bus: &mut Bus<'_>) -> Result<usize, BusError> {
        let now = bus.clock.now();
        let due = self.endpoint.registry.take_due(now);
        for context in &due {
            let Some(entry) = self.endpoint.registry.get(context).cloned() else {
                continue;
            };
            error!("{} didn't get reply on {}", self.name(), context);
            self.run_handler(context, entry, None, bus)?;
            // A handler that re-registered itself has a fresh deadline
            if self.endpoint.registry.get(context).map_or(false, |e| e.timed_out(now)) {
                self.endpoint.registry.discard(context);
            }
        }
        Ok(due.len())
    }

    /// Runs a reply handler for real; `message` is `None` on timeout.
    fn run_handler(
        &mut self,
        context: &TalkContext,
        entry: RegistryEntry,
        message: Option<&Message>,
        bus: &mut Bus<'_>,
    ) -> Result<(), BusError> {
        match (&entry.kind, message) {
            (HandlerKind::StartWait, _) => self.on_start_reply(context, &entry, message, bus),
            (HandlerKind::StopWait, _) => self.on_stop_reply(context, &entry, message, bus),
            (HandlerKind::Request { tag }, None) => {
                let mut state = Kwargs::new();
                state.insert("__timeouted__".into(), Value::Bool(true));
                self.endpoint.registry.unregister(context, false, state, true)?;
                let end = RequestEnd {
                    context: context.clone(),
                    success: false,
                    timed_out: true,
                    message: None,
                    args: entry.args,
                    kwargs: entry.kwargs,
                };
                self.resume(tag.as_deref(), end, bus);
                Ok(())
            }
            (HandlerKind::Request { tag }, Some(reply)) => {
                if !reply.is_success() && !reply.is_failure() {
                    return Ok(());
                }
                let mut state = Kwargs::new();
                let raw = serde_json::to_value(reply)
                    .map_err(|e| BusError::malformed(format!("reply can't be stored: {}", e)))?;
                state.insert("__message__".into(), raw);
                self.endpoint
                    .registry
                    .unregister(context, reply.is_success(), state, true)?;
                let end = RequestEnd {
                    context: context.clone(),
                    success: reply.is_success(),
                    timed_out: false,
                    message: entry.send_message.then(|| reply.clone()),
                    args: entry.args,
                    kwargs: entry.kwargs,
                };
                self.resume(tag.as_deref(), end, bus);
                Ok(())
            }
        }
    }

    /// Hands a finished request to the worker's continuation.
    fn resume(&mut self, tag: Option<&str>, end: RequestEnd, bus: &mut Bus<'_>) {
        let Some(tag) = tag else {
            return;
        };
        let mut cx = self.endpoint.cx(bus);
        if let Err(e) = self.worker.on_reply(tag, end, &mut cx) {
            error!("{}: continuation {} failed: {:#}", self.endpoint.name, tag, e);
        }
    }

    /// Sends a terminal reply from this component.
    pub(crate) fn reply(&self, bus: &mut Bus<'_>, context: &TalkContext, outcome: Outcome) {
        bus.outbox.push(stamp(self.name(), context, outcome.to_message()));
    }

    pub(crate) fn reply_all(&self, bus: &mut Bus<'_>, contexts: &[TalkContext], outcome: &Outcome) {
        for c in contexts {
            self.reply(bus, c, outcome.clone());
        }
    }

    pub(crate) fn notify(&self, bus: &mut Bus<'_>, context: &TalkContext, state: &str) {
        bus.outbox.push(stamp(self.name(), context, Message::notify(state)));
    }

    pub(crate) fn notify_all(&self, bus: &mut Bus<'_>, contexts: &[TalkContext], state: &str) {
        for c in contexts {
            self.notify(bus, c, state);
        }
    }

    /// Routes a call to the lifecycle protocol or a hosted protocol.
    fn dispatch(&mut self, context: &TalkContext, message: &Message, bus: &mut Bus<'_>) -> Result<(), BusError> {
        if self.lifecycle.supports(message) {
            let decision = self.lifecycle_faults.check(context.channel(), message, false);
            return self.dispatch_lifecycle(context, message, decision, bus);
        }
        let Some(idx) = self
            .protocols
            .iter()
            .position(|s| s.protocol.interface().supports(message))
        else {
            warn!("{}: no protocol for {}", self.name(), message.summary());
            return Ok(());
        };

        let decision = self.protocols[idx].faults.check(context.channel(), message, false);
        let override_ = match decision {
            FaultDecision::Replace(outcome) => {
                self.reply(bus, context, outcome);
                return Ok(());
            }
            FaultDecision::Override(ov) => ov,
            FaultDecision::Proceed => ReplyOverride::default(),
        };

        if message.method == TESTING_METHOD {
            let outcome = register_faults(&mut self.protocols[idx].faults, context, message)?;
            self.reply(bus, context, outcome);
            return Ok(());
        }
        if self.protocols[idx].protocol.requires_running() && !self.flags.running {
            self.reply(bus, context, override_.apply(Outcome::failure("Wasn't started!")));
            return Ok(());
        }
        self.notify(bus, context, &format!("Calling {}...", message.method));

        let result = {
            let mut cx = self.endpoint.cx(bus);
            let mut call = Call {
                context,
                message,
                cx: &mut cx,
            };
            self.protocols[idx].protocol.invoke(self.worker.as_mut(), &mut call)
        };
        match result {
            Ok(Completion::Reply(outcome)) => self.reply(bus, context, override_.apply(outcome)),
            Ok(Completion::Deferred) => {
                debug!("{}: {} completes later", self.name(), context);
            }
            Err(e) => {
                error!("{}: {} raised: {:#}", self.name(), message.summary(), e);
                self.reply(bus, context, override_.apply(Outcome::exception(&message.method, &e)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.endpoint.name)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Generation of the lifecycle action a wait handler belongs to.
pub(crate) fn entry_generation(entry: &RegistryEntry) -> Option<u64> {
    entry.kwargs.get("generation").and_then(Value::as_u64)
}

/// Handles the reserved `__testing__` method.
///
/// # Errors
/// A `fake_next_op` payload that isn't a rule or a list of rules.
pub(crate) fn register_faults(
    queue: &mut FaultQueue,
    context: &TalkContext,
    message: &Message,
) -> Result<Outcome, BusError> {
    let kind = message.args.first().and_then(Value::as_str).unwrap_or_default();
    if kind != "fake_next_op" {
        return Ok(Outcome::failure(format!("Unsupported testing function '{}'", kind)));
    }
    let payload = message
        .args
        .get(1)
        .cloned()
        .ok_or_else(|| BusError::malformed("fake_next_op without rule"))?;
    let raw = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    for item in raw {
        let rule: FaultRule = serde_json::from_value(item)
            .map_err(|e| BusError::malformed(format!("fake_next_op rule: {}", e)))?;
        queue.register(context.channel(), rule);
    }
    Ok(Outcome::success_fields(Kwargs::new()))
}
