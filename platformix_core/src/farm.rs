//! The Farm: component registry, channel owner and message pump.
//!
//! # Processing model
//!
//! Everything runs on the thread that owns the Farm. A send is delivered
//! synchronously to the channel's audience, which only *queues* what it
//! accepts. The drain loop then processes queued input component by
//! component, posting whatever each one produced, until the bus is quiet:
//!
//! ```text
//!   ┌──────────────► poll mailboxes (replies from adapter threads)
//!   │                        │
//!   │                        ▼
//!   │   queue_received() for all, then process_queued() in registration order
//!   │                        │  outbox posted after each component
//!   │                        ▼
//!   │                  fire due timeouts
//!   │                        │
//!   └── anything happened? ──┤
//!                            │ no
//!                            ▼
//!         tickets outstanding, or the watched thread still only
//!         notified while someone waits?  ── yes ──► pause, loop
//!                            │ no
//!                            ▼
//!                          done
//! ```
//!
//! A transaction is a top-level send that drains until its thread settles
//! and returns the last reply of every participant.

use crate::channel::{Channel, ChannelSettings, ChannelTable, ConversationEntry, Envelope, Recipients, ReplyRouting};
use crate::component::{Bus, Component, PeerView};
use crate::config::FarmConfig;
use crate::context::TalkContext;
use crate::error::BusError;
use crate::message::Message;
use platformix_env::BusContext;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause between mailbox polls while only tickets are outstanding.
const TICKET_POLL: Duration = Duration::from_millis(1);

/// Name under which the test environment takes part in conversations.
pub const ENVIRONMENT: &str = "__root__";

/// Last reply of every participant of a thread, keyed by sender.
pub type Replies = BTreeMap<String, Message>;

/// How `Farm::send` processes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processing {
    /// Deliver only; recipients keep it queued
    Enqueue,
    /// Deliver and drain until the bus is quiet
    Drain,
    /// Deliver, drain until the thread settles and collect its replies
    Transaction,
}

/// Channel audience made of the registered components and the environment.
struct Audience<'a> {
    components: &'a mut [Component],
    index: &'a HashMap<String, usize>,
    now: Duration,
}

impl Recipients for Audience<'_> {
    fn receive(&mut self, name: &str, context: &TalkContext, message: &Message) -> Result<bool, BusError> {
        if name == ENVIRONMENT {
            return Ok(message.is_reply());
        }
        Ok(match self.index.get(name) {
            Some(&i) => self.components[i].receive(context, message, self.now),
            None => false,
        })
    }
}

/// Registry and message pump of a test session.
pub struct Farm {
    config: FarmConfig,
    clock: Arc<dyn BusContext>,
    channels: ChannelTable,

    /// Registered components in registration order
    components: Vec<Component>,
    index: HashMap<String, usize>,

    /// Constructed components whose parent or wait-list isn't registered yet
    awaiting: Vec<Component>,

    /// Stays raised after a transaction failed mid-drain
    transaction_depth: usize,

    /// Replies collected per watched thread
    harvest: HashMap<(String, u64), Replies>,
}

impl Farm {
    pub fn new(config: FarmConfig, clock: Arc<dyn BusContext>) -> Self {
        let settings = ChannelSettings {
            print_messages: config.print_messages,
            gather_conversation: config.gather_conversation,
            gather_all: config.gather_all,
        };
        Self {
            config,
            clock,
            channels: ChannelTable::new(settings),
            components: Vec::new(),
            index: HashMap::new(),
            awaiting: Vec::new(),
            transaction_depth: 0,
            harvest: HashMap::new(),
        }
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn BusContext> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a component.
    ///
    /// Returns `Ok(false)` when the component has to wait for its parent or
    /// a wait-list entry; it is registered automatically once they are.
    ///
    /// # Errors
    /// `DuplicateComponent` for a taken name, `DependencyCycle` when the
    /// awaiting components would never become registrable.
    pub fn register(&mut self, component: Component) -> Result<bool, BusError> {
        let name = component.name().to_string();
        if self.index.contains_key(&name) || self.awaiting.iter().any(|c| c.name() == name) {
            return Err(BusError::DuplicateComponent(name));
        }
        if self.is_ready(&component) {
            self.finish_registration(component);
            self.check_awaiting();
            return Ok(true);
        }
        self.awaiting.push(component);
        if let Some(cycle) = self.find_cycle(&name) {
            self.awaiting.pop();
            return Err(BusError::DependencyCycle(cycle));
        }
        debug!("{} awaits its prerequisites", name);
        Ok(false)
    }

    fn is_ready(&self, component: &Component) -> bool {
        component.wait_list().iter().all(|w| self.index.contains_key(w))
    }

    fn finish_registration(&mut self, component: Component) {
        let name = component.name().to_string();
        for channel in component.subscriptions() {
            self.channels.subscribe(channel, &name);
        }
        if let Some(&p) = component.parent().and_then(|p| self.index.get(p)) {
            self.components[p].subplatforms.push(name.clone());
        }
        for w in component.wait() {
            if let Some(&i) = self.index.get(w) {
                self.components[i].depended.push(name.clone());
            }
        }
        self.index.insert(name.clone(), self.components.len());
        self.components.push(component);
        info!("Registered {}", name);
    }

    fn check_awaiting(&mut self) {
        while let Some(pos) = self.awaiting.iter().position(|c| self.is_ready(c)) {
            let component = self.awaiting.remove(pos);
            self.finish_registration(component);
        }
    }

    /// Path of awaiting components leading from `start` back to itself.
    fn find_cycle(&self, start: &str) -> Option<Vec<String>> {
        let deps: HashMap<&str, Vec<String>> = self.awaiting.iter().map(|c| (c.name(), c.wait_list())).collect();

        fn walk(
            node: &str,
            start: &str,
            deps: &HashMap<&str, Vec<String>>,
            visited: &mut HashSet<String>,
            path: &mut Vec<String>,
        ) -> bool {
            for next in deps.get(node).into_iter().flatten() {
                if next == start {
                    path.push(start.to_string());
                    return true;
                }
                if deps.contains_key(next.as_str()) && visited.insert(next.clone()) {
                    path.push(next.clone());
                    if walk(next, start, deps, visited, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = vec![start.to_string()];
        let mut visited = HashSet::new();
        walk(start, start, &deps, &mut visited, &mut path).then_some(path)
    }

    /// Removes a component together with its subplatforms.
    ///
    /// # Errors
    /// `UnknownComponent` if the name is neither registered nor awaiting.
    pub fn unregister(&mut self, name: &str) -> Result<Component, BusError> {
        if let Some(pos) = self.awaiting.iter().position(|c| c.name() == name) {
            return Ok(self.awaiting.remove(pos));
        }
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| BusError::UnknownComponent(name.to_string()))?;
        for child in self.components[i].subplatforms.clone() {
            self.unregister(&child)?;
        }

        let i = self.index[name];
        let component = self.components.remove(i);
        self.rebuild_index();
        for channel in component.subscriptions() {
            let _ = self.channels.unsubscribe(channel, name);
        }
        for other in &mut self.components {
            other.subplatforms.retain(|s| s != name);
            other.depended.retain(|s| s != name);
        }
        info!("Unregistered {}", name);
        Ok(component)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_string(), i))
            .collect();
    }

    /// Names of components still waiting for prerequisites.
    pub fn awaiting(&self) -> Vec<&str> {
        self.awaiting.iter().map(|c| c.name()).collect()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.index.get(name).map(|&i| &self.components[i])
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.index.get(name).map(|&i| &mut self.components[i])
    }

    /// Registered components in registration order.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.names()
    }

    /// Recorded deliveries of a thread.
    pub fn conversation(&self, context: &TalkContext) -> Option<&[ConversationEntry]> {
        self.channels.get(context.channel())?.conversation(context.thread())
    }

    /// # Errors
    /// `UnknownComponent` for a name that isn't registered.
    pub fn is_running(&self, name: &str) -> Result<bool, BusError> {
        self.component(name)
            .map(Component::is_running)
            .ok_or_else(|| BusError::UnknownComponent(name.to_string()))
    }

    pub fn all_running(&self) -> bool {
        self.components.iter().all(Component::is_running)
    }

    /// Nothing running and no lifecycle action left half-done.
    pub fn all_stopped(&self) -> bool {
        self.components
            .iter()
            .all(|c| !c.is_running() && c.active_action().is_none())
    }

    pub fn transaction_in_progress(&self) -> bool {
        self.transaction_depth > 0
    }

    // ------------------------------------------------------------------
    // Channels and conversations
    // ------------------------------------------------------------------

    /// Subscribes a registered component to `channel`, creating it if needed.
    ///
    /// # Errors
    /// `UnknownComponent` for a name that isn't registered.
    pub fn subscribe(&mut self, name: &str, channel: &str) -> Result<bool, BusError> {
        let component = self
            .component_mut(name)
            .ok_or_else(|| BusError::UnknownComponent(name.to_string()))?;
        component.add_subscription(channel);
        Ok(self.channels.subscribe(channel, name))
    }

    /// # Errors
    /// `UnknownComponent` or `UnknownChannel`.
    pub fn unsubscribe(&mut self, name: &str, channel: &str) -> Result<bool, BusError> {
        let component = self
            .component_mut(name)
            .ok_or_else(|| BusError::UnknownComponent(name.to_string()))?;
        component.remove_subscription(channel);
        self.channels.unsubscribe(channel, name)
    }

    /// Opens a thread cast by the environment.
    ///
    /// # Errors
    /// `UnknownChannel` if nobody ever subscribed to `channel`.
    pub fn start_conversation(
        &mut self,
        channel: &str,
        interface: &str,
        routing: ReplyRouting,
    ) -> Result<TalkContext, BusError> {
        self.channels.start_conversation(channel, interface, ENVIRONMENT, routing)
    }

    /// Sends `message` from the environment.
    ///
    /// `None` picks `Transaction` for calls and `Enqueue` for replies.
    /// Only a transaction returns replies.
    ///
    /// # Errors
    /// Unknown channel, a reply sent as a transaction, a transaction while
    /// another one is draining (or was left broken), and any violation
    /// raised while processing. After a failure mid-transaction the session
    /// stays broken until `emergency_stop`.
    pub fn send(
        &mut self,
        context: &TalkContext,
        mut message: Message,
        processing: Option<Processing>,
    ) -> Result<Option<Replies>, BusError> {
        if !self.channels.contains(context.channel()) {
            return Err(BusError::UnknownChannel(context.channel().to_string()));
        }
        if message.sender.is_none() {
            message.sender = Some(ENVIRONMENT.to_string());
        }
        let processing = processing.unwrap_or(if message.is_reply() {
            Processing::Enqueue
        } else {
            Processing::Transaction
        });
        let envelope = Envelope::new(context.clone(), message);
        match processing {
            Processing::Enqueue => {
                self.post(envelope)?;
                Ok(None)
            }
            Processing::Drain => {
                self.post(envelope)?;
                self.drain_until(None)?;
                Ok(None)
            }
            Processing::Transaction => {
                if envelope.message.is_reply() {
                    return Err(BusError::violation(format!(
                        "reply can't open a transaction on {}",
                        context
                    )));
                }
                if self.transaction_depth > 0 {
                    return Err(BusError::TransactionInProgress);
                }
                let key = (context.channel().to_string(), context.thread());
                if self.harvest.contains_key(&key) {
                    return Err(BusError::violation(format!("{} is already watched", context)));
                }
                self.harvest.insert(key.clone(), Replies::new());
                self.transaction_depth += 1;
                self.post(envelope)?;
                self.drain_until(Some(context))?;
                self.transaction_depth -= 1;
                Ok(self.harvest.remove(&key))
            }
        }
    }

    /// Drains until the bus is quiet.
    pub fn drain(&mut self) -> Result<(), BusError> {
        self.drain_until(None)
    }

    /// Delivers an envelope and everything forwarded to other channels.
    fn post(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let mut pending = VecDeque::from([envelope]);
        while let Some(Envelope { context, message }) = pending.pop_front() {
            message.validate()?;
            if message.is_reply() {
                let key = (context.channel().to_string(), context.thread());
                if let (Some(replies), Some(sender)) = (self.harvest.get_mut(&key), &message.sender) {
                    replies.insert(sender.clone(), message.clone());
                }
            }
            let channel = self
                .channels
                .get_mut(context.channel())
                .ok_or_else(|| BusError::UnknownChannel(context.channel().to_string()))?;
            let mut audience = Audience {
                components: &mut self.components,
                index: &self.index,
                now: self.clock.now(),
            };
            let report = channel.send(context, message, &mut audience, self.clock.as_ref())?;
            pending.extend(report.forwarded);
        }
        Ok(())
    }

    fn post_all(&mut self, outbox: Vec<Envelope>) -> Result<(), BusError> {
        for envelope in outbox {
            self.post(envelope)?;
        }
        Ok(())
    }

    fn drain_until(&mut self, watch: Option<&TalkContext>) -> Result<(), BusError> {
        let mut idle_since: Option<Instant> = None;
        loop {
            let mut active = false;

            let mut outbox = Vec::new();
            for c in &mut self.components {
                if c.poll_mailbox(&mut outbox) > 0 {
                    active = true;
                }
            }
            self.post_all(outbox)?;

            if self.components.iter().any(|c| c.pending_input() > 0) {
                self.process_messages()?;
                active = true;
            }
            if self.fire_timeouts()? > 0 {
                active = true;
            }
            if active {
                idle_since = None;
                continue;
            }

            let in_flight: usize = self.components.iter().map(Component::in_flight).sum();
            if in_flight > 0 {
                // Tickets are answered in real time; virtual time must not run ahead of them
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.ticket_wait {
                    error!("{} ticket(s) unanswered after {:?}", in_flight, self.config.ticket_wait);
                    return Err(BusError::StalledTickets {
                        count: in_flight,
                        waited: self.config.ticket_wait,
                    });
                }
                std::thread::sleep(TICKET_POLL);
                continue;
            }
            if let Some(context) = watch {
                let unsettled = self.thread_unsettled(context);
                if unsettled && self.components.iter().any(Component::waiting_reply) {
                    self.clock.pause();
                    continue;
                }
                if unsettled {
                    warn!("{} ended with progress notifies only", context);
                }
            }
            return Ok(());
        }
    }

    /// Some participant's last word on the watched thread is a notify.
    fn thread_unsettled(&self, context: &TalkContext) -> bool {
        self.harvest
            .get(&(context.channel().to_string(), context.thread()))
            .map_or(false, |r| r.values().any(Message::is_notify))
    }

    fn peer_view(&self) -> PeerView {
        self.components
            .iter()
            .map(|c| (c.name().to_string(), c.peer_state()))
            .collect()
    }

    /// One processing pass over every component with queued input.
    pub fn process_messages(&mut self) -> Result<(), BusError> {
        for c in &mut self.components {
            c.queue_received();
        }
        for i in 0..self.components.len() {
            self.process_at(i)?;
        }
        Ok(())
    }

    /// Processes the received input of one component only.
    ///
    /// # Errors
    /// `UnknownComponent`, or whatever processing raises.
    pub fn process_component(&mut self, name: &str) -> Result<(), BusError> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| BusError::UnknownComponent(name.to_string()))?;
        self.components[i].queue_received();
        self.process_at(i)
    }

    fn process_at(&mut self, i: usize) -> Result<(), BusError> {
        if !self.components[i].has_queued() {
            return Ok(());
        }
        let peers = self.peer_view();
        let mut outbox = Vec::new();
        let result = {
            let mut bus = Bus {
                channels: &mut self.channels,
                outbox: &mut outbox,
                clock: self.clock.as_ref(),
                config: &self.config,
                peers: &peers,
            };
            self.components[i].process_queued(&mut bus)
        };
        result?;
        self.post_all(outbox)
    }

    fn fire_timeouts(&mut self) -> Result<usize, BusError> {
        let mut fired = 0;
        for i in 0..self.components.len() {
            let peers = self.peer_view();
            let mut outbox = Vec::new();
            let n = {
                let mut bus = Bus {
                    channels: &mut self.channels,
                    outbox: &mut outbox,
                    clock: self.clock.as_ref(),
                    config: &self.config,
                    peers: &peers,
                };
                self.components[i].fire_timeouts(&mut bus)?
            };
            fired += n;
            self.post_all(outbox)?;
        }
        Ok(fired)
    }

    /// Stops every component directly, last registered first.
    ///
    /// Bypasses the bus; anything the workers try to send is discarded.
    /// Clears a broken session. Returns false if any stop failed.
    pub fn emergency_stop(&mut self) -> bool {
        warn!("Emergency stop of {} components", self.components.len());
        let mut ok = true;
        for i in (0..self.components.len()).rev() {
            let peers = self.peer_view();
            let mut outbox = Vec::new();
            let result = {
                let mut bus = Bus {
                    channels: &mut self.channels,
                    outbox: &mut outbox,
                    clock: self.clock.as_ref(),
                    config: &self.config,
                    peers: &peers,
                };
                self.components[i].force_stop(&mut bus)
            };
            let name = self.components[i].name();
            match result {
                Ok(o) if o.is_success() => debug!("{} stopped", name),
                Ok(o) => {
                    error!("{} failed to stop: {}", name, o.to_message().summary());
                    ok = false;
                }
                Err(e) => {
                    error!("{} failed to stop: {:#}", name, e);
                    ok = false;
                }
            }
        }
        self.transaction_depth = 0;
        self.harvest.clear();
        ok
    }
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm")
            .field("components", &self.components)
            .field("awaiting", &self.awaiting())
            .field("transaction_depth", &self.transaction_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentSpec, PLATFORMS_CHANNEL};
    use crate::fault::FaultRule;
    use crate::interface::{Call, Completion, Interface, MethodTable, Protocol};
    use crate::lifecycle::PLATFORMIX;
    use crate::mailbox::Ticket;
    use crate::message::Outcome;
    use crate::worker::{RequestEnd, RequestOptions, Worker, WorkerCx};
    use platformix_env::ManualContext;
    use serde_json::{json, Value};
    use std::any::Any;

    #[derive(Default)]
    struct Plain {
        fail_start: bool,
        fail_stop: bool,
        starts: usize,
        stops: usize,
        tag: Value,
    }

    impl Worker for Plain {
        fn start(&mut self, _cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
            self.starts += 1;
            if self.fail_start {
                return Ok(Outcome::failure("boom"));
            }
            Ok(Outcome::success(Value::Null))
        }

        fn stop(&mut self, _cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
            self.stops += 1;
            if self.fail_stop {
                anyhow::bail!("stuck");
            }
            Ok(Outcome::success(Value::Null))
        }

        fn property(&self, name: &str) -> Option<Value> {
            (name == "tag").then(|| self.tag.clone())
        }

        fn set_property(&mut self, name: &str, value: Value) -> Option<anyhow::Result<Value>> {
            (name == "tag").then(|| {
                self.tag = value.clone();
                Ok(value)
            })
        }

        fn invoke(&mut self, method: &str, args: &[Value]) -> Option<anyhow::Result<Value>> {
            match method {
                "echo" if args.is_empty() => Some(Err(anyhow::anyhow!("At least one arg expected"))),
                "echo" => Some(Ok(Value::Array(args.iter().rev().cloned().collect()))),
                _ => None,
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Hosts `arith`; `sum` answers inline, `slow_sum` from another thread,
    /// `ask` asks a peer for a property and answers with it.
    #[derive(Default)]
    struct Adder {
        pending: Option<TalkContext>,
        held: Option<Ticket>,
    }

    impl Worker for Adder {
        fn on_reply(&mut self, tag: &str, end: RequestEnd, cx: &mut WorkerCx<'_>) -> anyhow::Result<()> {
            assert_eq!(tag, "asked");
            let caller = self.pending.take().ok_or_else(|| anyhow::anyhow!("nobody asked"))?;
            let outcome = match end.message {
                Some(m) if end.success => Outcome::success(m.value("tag").cloned().unwrap_or(Value::Null)),
                _ => Outcome::failure("peer didn't answer"),
            };
            cx.reply(&caller, outcome);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Takes every `arith` message it overhears.
    #[derive(Default)]
    struct Watcher {
        seen: Vec<String>,
    }

    impl Worker for Watcher {
        fn observe(&mut self, context: &TalkContext, message: &Message) -> bool {
            if context.interface() != "arith" {
                return false;
            }
            self.seen.push(message.summary());
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn sum(_w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let a: i64 = call.arg(0)?;
        let b: i64 = call.arg(1)?;
        Ok(Outcome::success(a + b).into())
    }

    fn slow_sum(_w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let a: i64 = call.arg(0)?;
        let b: i64 = call.arg(1)?;
        let ticket = call.ticket();
        std::thread::spawn(move || {
            ticket.notify("thinking");
            ticket.complete(Outcome::success(a + b));
        });
        Ok(Completion::Deferred)
    }

    fn hold(w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        w.held = Some(call.ticket());
        Ok(Completion::Deferred)
    }

    fn ask(w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let peer: String = call.arg(0)?;
        let request = Message::call(PLATFORMIX, "get").with_arg("tag");
        call.cx
            .request(request, RequestOptions::tagged("asked").on_channel(format!("@{}", peer)))?;
        w.pending = Some(call.context.clone());
        Ok(Completion::Deferred)
    }

    fn arith() -> Box<dyn Protocol> {
        MethodTable::<Adder>::build(
            Interface::new("arith", &["sum", "slow_sum", "ask", "hold"]),
            &[("sum", sum), ("slow_sum", slow_sum), ("ask", ask), ("hold", hold)],
        )
        .unwrap()
        .boxed()
    }

    fn farm() -> (Farm, Arc<ManualContext>) {
        let clock = ManualContext::shared(7);
        (Farm::new(FarmConfig::default(), clock.clone()), clock)
    }

    fn add(farm: &mut Farm, spec: ComponentSpec, worker: Plain) -> bool {
        let c = Component::new(spec, Box::new(worker), vec![], farm.config()).unwrap();
        farm.register(c).unwrap()
    }

    fn add_adder(farm: &mut Farm, name: &str) {
        let c = Component::new(
            ComponentSpec::new(name, "adder"),
            Box::new(Adder::default()),
            vec![arith()],
            farm.config(),
        )
        .unwrap();
        farm.register(c).unwrap();
    }

    fn transact(farm: &mut Farm, channel: &str, message: Message) -> Replies {
        let ctx = farm
            .start_conversation(channel, &message.interface.clone(), ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, message, None).unwrap().unwrap()
    }

    fn broadcast(farm: &mut Farm, method: &str) -> Replies {
        transact(farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, method))
    }

    fn state_of(m: &Message) -> String {
        m.state().and_then(Value::as_str).unwrap_or_default().to_string()
    }

    #[test]
    fn test_start_and_stop_all() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain"), Plain::default());
        add(&mut farm, ComponentSpec::new("b", "plain").with_wait(["a"]), Plain::default());
        add(&mut farm, ComponentSpec::new("c", "plain").with_parent("b"), Plain::default());

        let replies = broadcast(&mut farm, "start");
        assert_eq!(replies.len(), 3);
        assert!(replies.values().all(Message::is_success));
        assert!(farm.all_running());
        assert_eq!(farm.component("a").unwrap().depended(), ["b".to_string()]);
        assert_eq!(farm.component("b").unwrap().subplatforms(), ["c".to_string()]);

        let replies = broadcast(&mut farm, "stop");
        assert!(replies.values().all(Message::is_success));
        assert!(farm.all_stopped());
        assert!(!farm.transaction_in_progress());
    }

    #[test]
    fn test_start_runs_worker_once_for_joined_requests() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());

        let first = farm
            .start_conversation(PLATFORMS_CHANNEL, PLATFORMIX, ReplyRouting::default())
            .unwrap();
        farm.send(&first, Message::call(PLATFORMIX, "start"), Some(Processing::Enqueue))
            .unwrap();
        let second = broadcast(&mut farm, "start");

        assert!(second["a"].is_success());
        assert!(second["b"].is_success());
        let a = farm.component("a").unwrap();
        assert_eq!(a.worker::<Plain>().unwrap().starts, 1);
        assert!(a.is_running());
        let answered_first = farm
            .conversation(&first)
            .unwrap()
            .iter()
            .any(|e| e.sender.as_deref() == Some("a") && e.receiver == ENVIRONMENT && e.summary.starts_with("success"));
        assert!(answered_first);
    }

    #[test]
    fn test_start_single_stepping() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        let ctx = farm
            .start_conversation(PLATFORMS_CHANNEL, PLATFORMIX, ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, Message::call(PLATFORMIX, "start"), Some(Processing::Enqueue))
            .unwrap();

        farm.process_component("a").unwrap();
        let a = farm.component("a").unwrap();
        assert!(a.flags().starting && !a.is_running());
        assert_eq!(a.waiting_for(), ["b".to_string()]);

        farm.process_component("b").unwrap();
        assert!(farm.is_running("b").unwrap());
        farm.process_component("a").unwrap();
        assert!(farm.is_running("a").unwrap());
        assert!(farm.component("a").unwrap().active_action().is_none());
    }

    #[test]
    fn test_dependency_failure_aborts_start() {
        let (mut farm, _) = farm();
        add(
            &mut farm,
            ComponentSpec::new("b", "plain"),
            Plain {
                fail_start: true,
                ..Default::default()
            },
        );
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());

        let replies = broadcast(&mut farm, "start");
        assert_eq!(state_of(&replies["b"]), "boom");
        assert_eq!(
            state_of(&replies["a"]),
            "Aborting start due to platform b failed to start"
        );
        let a = farm.component("a").unwrap();
        assert!(!a.is_running() && !a.flags().starting);
        assert_eq!(a.worker::<Plain>().unwrap().starts, 0);
        assert!(!a.waiting_reply());
    }

    #[test]
    fn test_dependency_failure_heard_by_waiting_dependent() {
        let (mut farm, _) = farm();
        add(
            &mut farm,
            ComponentSpec::new("b", "plain"),
            Plain {
                fail_start: true,
                ..Default::default()
            },
        );
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        let ctx = farm
            .start_conversation(PLATFORMS_CHANNEL, PLATFORMIX, ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, Message::call(PLATFORMIX, "start"), Some(Processing::Enqueue))
            .unwrap();

        // the dependent listens before the dependency answers
        farm.process_component("a").unwrap();
        assert!(farm.component("a").unwrap().waiting_reply());
        farm.process_component("b").unwrap();
        farm.process_component("a").unwrap();

        let a = farm.component("a").unwrap();
        assert!(!a.is_running() && !a.flags().starting);
        let answer = farm
            .conversation(&ctx)
            .unwrap()
            .iter()
            .find(|e| e.sender.as_deref() == Some("a") && e.receiver == ENVIRONMENT && e.summary.starts_with("fail"))
            .map(|e| e.summary.clone())
            .unwrap();
        assert!(answer.contains("Aborting start due to platform b failed to start"));
    }

    #[test]
    fn test_dependency_failure_propagates_down_the_chain() {
        let (mut farm, clock) = farm();
        add(
            &mut farm,
            ComponentSpec::new("a", "plain"),
            Plain {
                fail_start: true,
                ..Default::default()
            },
        );
        add(&mut farm, ComponentSpec::new("b", "plain").with_wait(["a"]), Plain::default());
        add(&mut farm, ComponentSpec::new("c", "plain").with_parent("b"), Plain::default());

        let replies = broadcast(&mut farm, "start");
        assert_eq!(state_of(&replies["b"]), "Aborting start due to platform a failed to start");
        assert_eq!(state_of(&replies["c"]), "Aborting start due to platform b failed to start");
        assert!(clock.now() < Duration::from_secs(1));
        assert!(farm.all_stopped());
    }

    #[test]
    fn test_earlier_failure_does_not_abort_next_start() {
        let (mut farm, _) = farm();
        add(
            &mut farm,
            ComponentSpec::new("b", "plain"),
            Plain {
                fail_start: true,
                ..Default::default()
            },
        );
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        let replies = broadcast(&mut farm, "start");
        assert!(replies["a"].is_failure());

        farm.component_mut("b").unwrap().worker_mut::<Plain>().unwrap().fail_start = false;
        let ctx = farm
            .start_conversation(PLATFORMS_CHANNEL, PLATFORMIX, ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, Message::call(PLATFORMIX, "start"), Some(Processing::Enqueue))
            .unwrap();
        farm.process_component("a").unwrap();
        assert!(farm.component("a").unwrap().flags().starting);
        farm.drain().unwrap();
        assert!(farm.all_running());
    }

    #[test]
    fn test_start_wait_timeout() {
        let (mut farm, clock) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        add(
            &mut farm,
            ComponentSpec::new("a", "plain")
                .with_wait(["b"])
                .with_start_max_wait(Duration::from_secs(1)),
            Plain::default(),
        );
        // b never hears about it
        let replies = transact(&mut farm, "@a", Message::call(PLATFORMIX, "start"));
        assert!(state_of(&replies["a"]).starts_with("Aborting start due to wait timeout"));
        assert!(clock.now() >= Duration::from_secs(1));
        assert!(!farm.is_running("a").unwrap());
    }

    #[test]
    fn test_stop_ignores_failed_children() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("p", "plain"), Plain::default());
        add(
            &mut farm,
            ComponentSpec::new("c", "plain").with_parent("p"),
            Plain {
                fail_stop: true,
                ..Default::default()
            },
        );
        broadcast(&mut farm, "start");
        assert!(farm.all_running());

        let replies = broadcast(&mut farm, "stop");
        assert!(replies["c"].is_failure());
        assert!(replies["p"].is_success());
        assert!(farm.all_stopped());
        assert_eq!(farm.component("p").unwrap().worker::<Plain>().unwrap().stops, 1);
    }

    #[test]
    fn test_start_and_stop_idempotent() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain"), Plain::default());
        let replies = broadcast(&mut farm, "stop");
        assert_eq!(state_of(&replies["a"]), "already stopped");
        broadcast(&mut farm, "start");
        let replies = broadcast(&mut farm, "start");
        assert_eq!(state_of(&replies["a"]), "already running");
        assert_eq!(farm.component("a").unwrap().worker::<Plain>().unwrap().starts, 1);
    }

    #[test]
    fn test_joined_stop_notifies_only_the_joiner() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("p", "plain"), Plain::default());
        add(&mut farm, ComponentSpec::new("c", "plain").with_parent("p"), Plain::default());
        broadcast(&mut farm, "start");
        assert!(farm.all_running());

        let first = farm.start_conversation("@p", PLATFORMIX, ReplyRouting::default()).unwrap();
        farm.send(&first, Message::call(PLATFORMIX, "stop"), Some(Processing::Enqueue))
            .unwrap();
        farm.process_component("p").unwrap();
        let second = farm.start_conversation("@p", PLATFORMIX, ReplyRouting::default()).unwrap();
        farm.send(&second, Message::call(PLATFORMIX, "stop"), Some(Processing::Enqueue))
            .unwrap();
        farm.process_component("p").unwrap();
        assert_eq!(farm.component("p").unwrap().waiting_for(), ["c".to_string()]);

        let waiting = |ctx: &TalkContext| {
            farm.conversation(ctx)
                .unwrap()
                .iter()
                .filter(|e| e.sender.as_deref() == Some("p") && e.summary.starts_with("notify") && e.summary.contains("waiting"))
                .count()
        };
        assert_eq!(waiting(&first), 1);
        assert_eq!(waiting(&second), 1);
    }

    #[test]
    fn test_stop_interrupts_waiting_start() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        let start = farm.start_conversation("@a", PLATFORMIX, ReplyRouting::default()).unwrap();
        farm.send(&start, Message::call(PLATFORMIX, "start"), Some(Processing::Enqueue))
            .unwrap();
        farm.process_component("a").unwrap();
        assert!(farm.component("a").unwrap().flags().starting);

        let replies = transact(&mut farm, "@a", Message::call(PLATFORMIX, "stop"));
        assert!(replies["a"].is_success());
        let a = farm.component("a").unwrap();
        assert!(!a.flags().starting && !a.waiting_reply());
        let interrupted = farm
            .conversation(&start)
            .unwrap()
            .iter()
            .any(|e| e.summary.contains("interrupted by stop"));
        assert!(interrupted);
    }

    #[test]
    fn test_get_set_call_report() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain"), Plain::default());
        let get = |farm: &mut Farm, prop: &str| {
            transact(farm, "@a", Message::call(PLATFORMIX, "get").with_arg(prop)).remove("a").unwrap()
        };

        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "set").with_args(["tag", "blue"]));
        assert_eq!(r["a"].value("tag"), Some(&json!("blue")));
        assert_eq!(get(&mut farm, "tag").value("tag"), Some(&json!("blue")));
        assert_eq!(get(&mut farm, "name").value("name"), Some(&json!("a")));
        assert_eq!(state_of(&get(&mut farm, "color")), "Property color not found on a");

        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "call").with_args([json!("echo"), json!(1), json!(2)]));
        assert_eq!(r["a"].value("value"), Some(&json!([2, 1])));
        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "call").with_arg("echo"));
        assert_eq!(r["a"].errcode(), Some(crate::message::ERRCODE_EXCEPTION));
        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "call").with_arg("jump"));
        assert_eq!(state_of(&r["a"]), "Method jump not found on a");

        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "report").with_arg("is_running"));
        assert!(r["a"].is_failure());
        broadcast(&mut farm, "start");
        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "report").with_arg("is_running"));
        assert_eq!(state_of(&r["a"]), "True");
        let r = transact(&mut farm, "@a", Message::call(PLATFORMIX, "report").with_arg("mood"));
        assert!(r["a"].is_failure());
    }

    #[test]
    fn test_arith_requires_running() {
        let (mut farm, _) = farm();
        add_adder(&mut farm, "calc");
        let r = transact(&mut farm, "@calc", Message::call("arith", "sum").with_args([2, 3]));
        assert_eq!(state_of(&r["calc"]), "Wasn't started!");

        broadcast(&mut farm, "start");
        let r = transact(&mut farm, "@calc", Message::call("arith", "sum").with_args([2, 3]));
        assert_eq!(r["calc"].value("value"), Some(&json!(5)));
        let r = transact(&mut farm, "@calc", Message::call("arith", "sum").with_arg(2));
        assert_eq!(r["calc"].errcode(), Some(crate::message::ERRCODE_EXCEPTION));
    }

    #[test]
    fn test_reply_from_adapter_thread() {
        let (mut farm, _) = farm();
        add_adder(&mut farm, "calc");
        broadcast(&mut farm, "start");
        let r = transact(&mut farm, "@calc", Message::call("arith", "slow_sum").with_args([40, 2]));
        assert_eq!(r["calc"].value("value"), Some(&json!(42)));
        assert_eq!(farm.component("calc").unwrap().in_flight(), 0);
    }

    #[test]
    fn test_unanswered_ticket_ends_drain() {
        let config = FarmConfig {
            ticket_wait: Duration::from_millis(50),
            ..FarmConfig::default()
        };
        let mut farm = Farm::new(config, ManualContext::shared(7));
        add_adder(&mut farm, "calc");
        broadcast(&mut farm, "start");
        let ctx = farm.start_conversation("@calc", "arith", ReplyRouting::default()).unwrap();
        let r = farm.send(&ctx, Message::call("arith", "hold"), None);
        assert!(matches!(r, Err(BusError::StalledTickets { count: 1, .. })));
        assert_eq!(farm.component("calc").unwrap().in_flight(), 1);
    }

    #[test]
    fn test_observer_overhears_calls_and_replies() {
        let (mut farm, _) = farm();
        add_adder(&mut farm, "calc");
        let w = Component::new(
            ComponentSpec::new("w", "watcher").subscribe("@calc"),
            Box::new(Watcher::default()),
            vec![],
            farm.config(),
        )
        .unwrap();
        farm.register(w).unwrap();
        broadcast(&mut farm, "start");

        let r = transact(&mut farm, "@calc", Message::call("arith", "sum").with_args([2, 3]));
        assert_eq!(r["calc"].value("value"), Some(&json!(5)));
        assert!(!r.contains_key("w"));
        let seen = &farm.component("w").unwrap().worker::<Watcher>().unwrap().seen;
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("arith.sum"));
        assert!(seen[1].starts_with("success"));
    }

    #[test]
    fn test_request_continuation() {
        let (mut farm, _) = farm();
        add_adder(&mut farm, "calc");
        add(&mut farm, ComponentSpec::new("peer", "plain"), Plain {
            tag: json!("red"),
            ..Default::default()
        });
        broadcast(&mut farm, "start");
        let r = transact(&mut farm, "@calc", Message::call("arith", "ask").with_arg("peer"));
        assert_eq!(r["calc"].value("value"), Some(&json!("red")));
        assert!(!farm.component("calc").unwrap().waiting_reply());
    }

    #[test]
    fn test_fault_after_skips() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        broadcast(&mut farm, "start");
        let rule = FaultRule::new(Outcome::failure("forced"))
            .on_message(Message::call(PLATFORMIX, "report").with_arg("is_running").with_sender(ENVIRONMENT))
            .after(1);
        let r = transact(&mut farm, "@b", rule.into_message(PLATFORMIX));
        assert!(r["b"].is_success());

        let report = || Message::call(PLATFORMIX, "report").with_arg("is_running");
        assert!(transact(&mut farm, "@b", report())["b"].is_success());
        assert_eq!(state_of(&transact(&mut farm, "@b", report())["b"]), "forced");
        assert!(transact(&mut farm, "@b", report())["b"].is_success());
    }

    #[test]
    fn test_execute_rule_from_raw_json() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        broadcast(&mut farm, "start");
        let rule = json!({"reply": {"result": "failure", "state": "forced", "errcode": -1}, "execute": true});
        let m = Message::call(PLATFORMIX, crate::message::TESTING_METHOD).with_args([json!("fake_next_op"), rule]);
        assert!(transact(&mut farm, "@b", m)["b"].is_success());

        let r = transact(&mut farm, "@b", Message::call(PLATFORMIX, "report").with_arg("is_running"));
        assert_eq!(state_of(&r["b"]), "forced");
        assert!(r["b"].is_failure());
    }

    #[test]
    fn test_unsupported_testing_function() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        let m = Message::call(PLATFORMIX, crate::message::TESTING_METHOD).with_arg("teleport");
        let r = transact(&mut farm, "@b", m);
        assert_eq!(state_of(&r["b"]), "Unsupported testing function 'teleport'");
    }

    #[test]
    fn test_broken_session_rejects_transactions() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        let rule = FaultRule::new(Outcome::failure("x")).execute(None, None);
        transact(&mut farm, "@b", rule.into_message(PLATFORMIX));

        let ctx = farm.start_conversation("@b", PLATFORMIX, ReplyRouting::default()).unwrap();
        let r = farm.send(&ctx, Message::call(PLATFORMIX, "start"), None);
        assert!(matches!(r, Err(BusError::ProtocolViolation(_))));
        assert!(farm.transaction_in_progress());

        let ctx = farm.start_conversation("@b", PLATFORMIX, ReplyRouting::default()).unwrap();
        let r = farm.send(&ctx, Message::call(PLATFORMIX, "stop"), None);
        assert!(matches!(r, Err(BusError::TransactionInProgress)));

        assert!(farm.emergency_stop());
        assert!(!farm.transaction_in_progress());
    }

    #[test]
    fn test_reply_cannot_be_transaction() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain::default());
        let ctx = farm.start_conversation("@b", PLATFORMIX, ReplyRouting::default()).unwrap();
        let r = farm.send(&ctx, Message::success(1), Some(Processing::Transaction));
        assert!(matches!(r, Err(BusError::ProtocolViolation(_))));
        let r = farm.send(&TalkContext::new("@zz", 0, PLATFORMIX), Message::call(PLATFORMIX, "start"), None);
        assert!(matches!(r, Err(BusError::UnknownChannel(_))));
    }

    #[test]
    fn test_emergency_stop_reports_failures() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain"), Plain::default());
        add(&mut farm, ComponentSpec::new("b", "plain"), Plain {
            fail_stop: true,
            ..Default::default()
        });
        broadcast(&mut farm, "start");
        assert!(!farm.emergency_stop());
        assert!(farm.all_stopped());
        assert_eq!(farm.component("a").unwrap().worker::<Plain>().unwrap().stops, 1);
    }

    #[test]
    fn test_registration_waits_for_prerequisites() {
        let (mut farm, _) = farm();
        assert!(!add(&mut farm, ComponentSpec::new("child", "plain").with_parent("root"), Plain::default()));
        assert!(!add(&mut farm, ComponentSpec::new("user", "plain").with_wait(["child"]), Plain::default()));
        assert_eq!(farm.awaiting(), ["child", "user"]);
        assert!(add(&mut farm, ComponentSpec::new("root", "plain"), Plain::default()));
        assert!(farm.awaiting().is_empty());
        let names: Vec<_> = farm.components().iter().map(Component::name).collect();
        assert_eq!(names, ["root", "child", "user"]);

        let dup = Component::new(ComponentSpec::new("root", "plain"), Box::new(Plain::default()), vec![], farm.config())
            .unwrap();
        assert!(matches!(farm.register(dup), Err(BusError::DuplicateComponent(_))));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain").with_wait(["b"]), Plain::default());
        add(&mut farm, ComponentSpec::new("b", "plain").with_wait(["c"]), Plain::default());
        let c = Component::new(
            ComponentSpec::new("c", "plain").with_wait(["a"]),
            Box::new(Plain::default()),
            vec![],
            farm.config(),
        )
        .unwrap();
        match farm.register(c) {
            Err(BusError::DependencyCycle(path)) => assert_eq!(path, ["c", "a", "b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(farm.awaiting(), ["a", "b"]);
    }

    #[test]
    fn test_self_wait_rejected() {
        let r = Component::new(
            ComponentSpec::new("a", "plain").with_wait(["a"]),
            Box::new(Plain::default()),
            vec![],
            &FarmConfig::default(),
        );
        assert!(matches!(r, Err(BusError::SelfWait(_))));
    }

    #[test]
    fn test_unregister_removes_subtree() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("p", "plain"), Plain::default());
        add(&mut farm, ComponentSpec::new("c", "plain").with_parent("p"), Plain::default());
        add(&mut farm, ComponentSpec::new("x", "plain"), Plain::default());
        farm.unregister("p").unwrap();
        assert!(farm.component("c").is_none());
        assert_eq!(farm.components().len(), 1);
        assert!(farm.is_running("x").is_ok());
        assert!(matches!(farm.is_running("p"), Err(BusError::UnknownComponent(_))));
        assert_eq!(farm.channel(PLATFORMS_CHANNEL).unwrap().subscribers(), ["x".to_string()]);
    }

    #[test]
    fn test_subscribe_extra_channel() {
        let (mut farm, _) = farm();
        add(&mut farm, ComponentSpec::new("a", "plain"), Plain::default());
        assert!(farm.subscribe("a", "#group").unwrap());
        let r = transact(&mut farm, "#group", Message::call(PLATFORMIX, "report").with_arg("running"));
        assert_eq!(r["a"].value("value"), Some(&json!("False")));
        assert!(farm.unsubscribe("a", "#group").unwrap());
        assert!(farm.subscribe("nobody", "#group").is_err());
    }
}
