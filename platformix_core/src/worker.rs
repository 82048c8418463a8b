//! The capability interface concrete components implement, and the bus
//! primitives handed to them while they run.

use crate::channel::{ChannelTable, Envelope, ReplyRouting};
use crate::config::FarmConfig;
use crate::context::TalkContext;
use crate::error::BusError;
use crate::mailbox::{Mailbox, Ticket};
use crate::message::{Kwargs, Message, Outcome};
use crate::registry::{HandlerKind, RegistryEntry, ReplyRegistry};
use platformix_env::BusContext;
use serde_json::Value;
use std::any::Any;
use std::time::Duration;

/// Behaviour of a concrete component.
///
/// Everything has a default so simple components only implement what they
/// expose. Hooks returning `Err` are treated as raised exceptions: the
/// component turns them into failure replies carrying the error text.
pub trait Worker: Any {
    /// Brings the component up; runs once all wait-list peers are running.
    fn start(&mut self, _cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
        Ok(Outcome::success(Value::Null))
    }

    /// Takes the component down; runs once children and dependents stopped.
    fn stop(&mut self, _cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
        Ok(Outcome::success(Value::Null))
    }

    /// Reads a property for `platformix.get`; `None` if there is no such property.
    fn property(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Writes a property for `platformix.set`; `None` if there is no such property.
    fn set_property(&mut self, _name: &str, _value: Value) -> Option<anyhow::Result<Value>> {
        None
    }

    /// Invokes a method for `platformix.call`; `None` if there is no such method.
    fn invoke(&mut self, _method: &str, _args: &[Value]) -> Option<anyhow::Result<Value>> {
        None
    }

    /// Traffic on a joined channel the component takes no part in: calls no
    /// hosted protocol supports and replies no handler waits for.
    ///
    /// Runs at delivery. Returns whether the message was taken.
    fn observe(&mut self, _context: &TalkContext, _message: &Message) -> bool {
        false
    }

    /// Continuation of a request issued with a tag.
    fn on_reply(&mut self, _tag: &str, _end: RequestEnd, _cx: &mut WorkerCx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Terminal state of a request issued by a worker.
#[derive(Debug, Clone)]
pub struct RequestEnd {
    pub context: TalkContext,
    pub success: bool,
    pub timed_out: bool,

    /// The terminal reply (absent on timeout or when not requested)
    pub message: Option<Message>,

    /// Handler arguments given at registration
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

/// Options of [`WorkerCx::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Channel to use; `None` means the parent's personal channel
    pub channel: Option<String>,

    /// Continuation tag passed back to `Worker::on_reply`
    pub tag: Option<String>,

    /// Completion timeout; `None` uses the Farm's default
    pub timeout: Option<Duration>,

    /// Park the end state for `pop_request_state`
    pub store_state: bool,

    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl RequestOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn storing_state(mut self) -> Self {
        self.store_state = true;
        self
    }
}

/// Bus primitives available to a worker while one of its hooks runs.
pub struct WorkerCx<'a> {
    pub(crate) name: &'a str,
    pub(crate) parent: Option<&'a str>,
    pub(crate) registry: &'a mut ReplyRegistry,
    pub(crate) mailbox: &'a Mailbox,
    pub(crate) channels: &'a mut ChannelTable,
    pub(crate) outbox: &'a mut Vec<Envelope>,
    pub(crate) clock: &'a dyn BusContext,
    pub(crate) config: &'a FarmConfig,
}

impl<'a> WorkerCx<'a> {
    /// Name of the component the worker belongs to.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn seed(&self) -> u64 {
        self.clock.seed()
    }

    /// Sends a raw message from this component.
    pub fn send(&mut self, context: &TalkContext, message: Message) {
        self.outbox.push(stamp(self.name, context, message));
    }

    /// Replies `outcome` in `context`.
    pub fn reply(&mut self, context: &TalkContext, outcome: Outcome) {
        self.send(context, outcome.to_message());
    }

    /// Replies `outcome` in every context.
    pub fn reply_all(&mut self, contexts: &[TalkContext], outcome: &Outcome) {
        for c in contexts {
            self.reply(c, outcome.clone());
        }
    }

    /// Sends a progress notify in `context`.
    pub fn notify(&mut self, context: &TalkContext, state: &str) {
        self.send(context, Message::notify(state));
    }

    /// Registers a reply handler for `context`.
    pub fn register_reply_handler(
        &mut self,
        context: TalkContext,
        entry: RegistryEntry,
        force: bool,
    ) -> Result<(), BusError> {
        self.registry.register(context, entry, force)
    }

    /// Unregisters the reply handler for `context`.
    pub fn unregister_reply_handler(
        &mut self,
        context: &TalkContext,
        success: bool,
        state: Kwargs,
        dont_check: bool,
    ) -> Result<(), BusError> {
        self.registry.unregister(context, success, state, dont_check).map(|_| ())
    }

    /// Starts a new conversation and sends `message` as its topic.
    ///
    /// The reply is correlated through a `Request` handler; the worker is
    /// resumed through `on_reply` when a tag is given.
    ///
    /// # Errors
    /// No channel given and no parent, unknown channel, or a handler
    /// already registered for the fresh context.
    pub fn request(&mut self, message: Message, options: RequestOptions) -> Result<TalkContext, BusError> {
        let channel = match (&options.channel, self.parent) {
            (Some(c), _) => c.clone(),
            (None, Some(p)) => format!("@{}", p),
            (None, None) => {
                return Err(BusError::violation(format!(
                    "{}: request without channel needs a parent",
                    self.name
                )))
            }
        };
        let context = self.channels.start_conversation(
            &channel,
            &message.interface,
            self.name,
            ReplyRouting::default(),
        )?;
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let entry = RegistryEntry::new(HandlerKind::Request { tag: options.tag })
            .with_timeout(self.clock.now(), Some(timeout))
            .with_store_state(options.store_state)
            .with_args(options.args, options.kwargs);
        self.registry.register(context.clone(), entry, false)?;
        self.send(&context, message);
        Ok(context)
    }

    /// Takes the parked end state of a completed request.
    pub fn pop_request_state(&mut self, context: &TalkContext) -> Option<Kwargs> {
        self.registry.pop_end_state(context)
    }

    /// Issues a ticket for answering `context` from another thread.
    pub fn ticket(&self, context: &TalkContext) -> Ticket {
        self.mailbox.ticket(context.clone())
    }
}

/// Binds a message to this component and context.
pub(crate) fn stamp(name: &str, context: &TalkContext, mut message: Message) -> Envelope {
    message.sender = Some(name.to_string());
    if message.is_reply() {
        message.interface = context.interface().to_string();
    }
    Envelope::new(context.clone(), message)
}

/// Whether a parked end state reports success.
pub fn request_state_is_success(state: &Kwargs) -> bool {
    state.get("__success__").and_then(Value::as_bool) == Some(true)
}
