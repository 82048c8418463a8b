//! Named pub/sub channel with conversation bookkeeping.
//!
//! # Delivery
//!
//! ```text
//!            send(ctx, msg)
//!                 │
//!        busy? ───┴── yes ──► queue (replayed after the in-flight send)
//!                 │ no
//!                 ▼
//!   subscribers (registration order, minus sender, minus caster*)
//!                 │
//!                 ▼
//!   topic caster (last, unless routing is subscribers-only)
//! ```
//!
//! Messages produced by recipients while a send is in flight are queued
//! behind it, so messages on one channel never interleave.

use crate::context::TalkContext;
use crate::error::BusError;
use crate::message::Message;
use platformix_env::BusContext;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Channel on which sends are silently dropped.
pub const VOID_CHANNEL: &str = "__void__";

/// A message bound to its conversation context.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub context: TalkContext,
    pub message: Message,
}

impl Envelope {
    pub fn new(context: TalkContext, message: Message) -> Self {
        Self { context, message }
    }
}

/// Where replies on a thread travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyRouting {
    /// Subscribers and the topic caster
    #[default]
    SubscribersAndCaster,
    /// Subscribers only; the caster never hears the thread
    SubscribersOnly,
    /// Replies go to the caster only
    CasterOnly,
}

/// One delivery attempt in a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    /// Global ordering number from the bus context
    pub order: u64,

    /// Context clock time of the delivery, in seconds
    pub at_secs: f64,

    pub sender: Option<String>,
    pub receiver: String,
    pub accepted: bool,
    pub summary: String,
}

#[derive(Debug, Clone)]
struct ThreadRecord {
    caster: String,
    routing: ReplyRouting,
    topic: Option<Message>,
    conversation: Vec<ConversationEntry>,
}

/// Per-channel logging switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelSettings {
    pub print_messages: bool,
    pub gather_conversation: bool,
    pub gather_all: bool,
}

/// Whoever can receive deliveries by name.
///
/// Implemented by the Farm over its component table.
pub trait Recipients {
    /// Offers `message` to `name`; returns whether it was accepted.
    fn receive(&mut self, name: &str, context: &TalkContext, message: &Message) -> Result<bool, BusError>;

    /// Messages produced by the last `receive`, sent after the in-flight one.
    ///
    /// Recipients that only queue input for a later processing pass keep
    /// the default.
    fn take_follow_ups(&mut self) -> Vec<Envelope> {
        Vec::new()
    }
}

/// Result of one `send`.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Deliveries attempted (including queued replays)
    pub delivered: usize,

    /// Deliveries accepted
    pub accepted: usize,

    /// The message was parked behind an in-flight send
    pub queued: bool,

    /// Follow-ups addressed to other channels
    pub forwarded: Vec<Envelope>,
}

/// A named pub/sub topic.
#[derive(Debug)]
pub struct Channel {
    name: String,
    subscribers: Vec<String>,
    threads: Vec<ThreadRecord>,
    queue: VecDeque<Envelope>,
    busy: bool,
    settings: ChannelSettings,
}

impl Channel {
    pub fn new(name: impl Into<String>, settings: ChannelSettings) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
            threads: Vec::new(),
            queue: VecDeque::new(),
            busy: false,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a subscriber; returns false if it was already subscribed.
    pub fn subscribe(&mut self, subscriber: &str) -> bool {
        if self.subscribers.iter().any(|s| s == subscriber) {
            return false;
        }
        self.subscribers.push(subscriber.to_string());
        true
    }

    /// Removes a subscriber; returns false if it wasn't subscribed.
    pub fn unsubscribe(&mut self, subscriber: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s != subscriber);
        before != self.subscribers.len()
    }

    pub fn subscribers(&self) -> &[String] {
        &self.subscribers
    }

    /// Allocates the next thread id.
    pub fn start_thread(&mut self, caster: &str, routing: ReplyRouting) -> u64 {
        self.threads.push(ThreadRecord {
            caster: caster.to_string(),
            routing,
            topic: None,
            conversation: Vec::new(),
        });
        (self.threads.len() - 1) as u64
    }

    pub fn thread_count(&self) -> u64 {
        self.threads.len() as u64
    }

    /// First message of a thread.
    pub fn topic(&self, thread: u64) -> Option<&Message> {
        self.threads.get(thread as usize).and_then(|t| t.topic.as_ref())
    }

    /// Topic caster of a thread.
    pub fn caster(&self, thread: u64) -> Option<&str> {
        self.threads.get(thread as usize).map(|t| t.caster.as_str())
    }

    /// Recorded deliveries of a thread.
    pub fn conversation(&self, thread: u64) -> Option<&[ConversationEntry]> {
        self.threads.get(thread as usize).map(|t| t.conversation.as_slice())
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Delivers `message` in `context` to this channel's audience.
    ///
    /// # Errors
    /// Protocol violations (wrong channel, unknown thread, a reply opening
    /// a thread, a call inside an open thread) and whatever a recipient's
    /// receive hook returns.
    pub fn send(
        &mut self,
        context: TalkContext,
        message: Message,
        recipients: &mut dyn Recipients,
        clock: &dyn BusContext,
    ) -> Result<SendReport, BusError> {
        if context.channel() != self.name {
            return Err(BusError::violation(format!(
                "context {} sent through channel {}",
                context, self.name
            )));
        }
        let mut report = SendReport::default();
        if self.name == VOID_CHANNEL {
            return Ok(report);
        }
        self.queue.push_back(Envelope::new(context, message));
        if self.busy {
            report.queued = true;
            return Ok(report);
        }
        self.busy = true;
        let result = self.flush(recipients, clock, &mut report);
        self.busy = false;
        if result.is_err() {
            self.queue.clear();
        }
        result.map(|_| report)
    }

    fn flush(
        &mut self,
        recipients: &mut dyn Recipients,
        clock: &dyn BusContext,
        report: &mut SendReport,
    ) -> Result<(), BusError> {
        while let Some(envelope) = self.queue.pop_front() {
            let mut follow_ups = Vec::new();
            self.deliver(&envelope, recipients, clock, report, &mut follow_ups)?;
            for f in follow_ups {
                if f.context.channel() == self.name {
                    self.queue.push_back(f);
                } else {
                    report.forwarded.push(f);
                }
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        envelope: &Envelope,
        recipients: &mut dyn Recipients,
        clock: &dyn BusContext,
        report: &mut SendReport,
        follow_ups: &mut Vec<Envelope>,
    ) -> Result<(), BusError> {
        let Envelope { context, message } = envelope;
        let thread = self
            .threads
            .get_mut(context.thread() as usize)
            .ok_or_else(|| BusError::UnknownThread {
                channel: self.name.clone(),
                thread: context.thread(),
            })?;

        match (&thread.topic, message.is_reply()) {
            (None, true) => {
                return Err(BusError::violation(format!(
                    "thread {} has to be opened by a non-reply message, got {}",
                    context, message
                )))
            }
            (None, false) => thread.topic = Some(message.clone()),
            (Some(topic), false) => {
                return Err(BusError::violation(format!(
                    "thread {} is already opened by {}, only replies are allowed, got {}",
                    context, topic, message
                )))
            }
            (Some(_), true) => {}
        }

        let caster = thread.caster.clone();
        let routing = thread.routing;
        let sender = message.sender.as_deref();

        let mut targets: Vec<String> = Vec::with_capacity(self.subscribers.len() + 1);
        if !(message.is_reply() && routing == ReplyRouting::CasterOnly) {
            for s in &self.subscribers {
                if Some(s.as_str()) == sender {
                    continue;
                }
                if *s == caster && routing != ReplyRouting::SubscribersOnly {
                    continue;
                }
                targets.push(s.clone());
            }
        }
        if routing != ReplyRouting::SubscribersOnly && sender != Some(caster.as_str()) {
            targets.push(caster);
        }

        let mut accepted = 0;
        for target in targets {
            let ok = recipients.receive(&target, context, message)?;
            follow_ups.extend(recipients.take_follow_ups());
            report.delivered += 1;
            if ok {
                accepted += 1;
            }
            if self.settings.print_messages {
                debug!(
                    "{} {} --> {}{} {}",
                    context,
                    sender.unwrap_or("env"),
                    if ok { "" } else { "x " },
                    target,
                    message.summary()
                );
            }
            if self.settings.gather_conversation && (ok || self.settings.gather_all) {
                if let Some(thread) = self.threads.get_mut(context.thread() as usize) {
                    thread.conversation.push(ConversationEntry {
                        order: clock.next_order(),
                        at_secs: clock.now().as_secs_f64(),
                        sender: message.sender.clone(),
                        receiver: target,
                        accepted: ok,
                        summary: message.summary(),
                    });
                }
            }
        }
        report.accepted += accepted;
        if accepted == 0 {
            debug!("{} {} had no effect", context, message.summary());
        }
        Ok(())
    }
}

/// All channels of a Farm, created lazily on first subscription.
///
/// Channels are never dropped: thread ids stay valid for the Farm's lifetime.
#[derive(Debug)]
pub struct ChannelTable {
    channels: HashMap<String, Channel>,
    settings: ChannelSettings,
}

impl ChannelTable {
    pub fn new(settings: ChannelSettings) -> Self {
        let mut channels = HashMap::new();
        channels.insert(VOID_CHANNEL.to_string(), Channel::new(VOID_CHANNEL, settings));
        Self { channels, settings }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    /// Channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribes `subscriber`, creating the channel if needed.
    pub fn subscribe(&mut self, channel: &str, subscriber: &str) -> bool {
        let settings = self.settings;
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel, settings))
            .subscribe(subscriber)
    }

    /// # Errors
    /// `UnknownChannel` if the channel was never created.
    pub fn unsubscribe(&mut self, channel: &str, subscriber: &str) -> Result<bool, BusError> {
        self.channels
            .get_mut(channel)
            .map(|c| c.unsubscribe(subscriber))
            .ok_or_else(|| BusError::UnknownChannel(channel.to_string()))
    }

    /// Allocates a thread on `channel` and returns its context.
    ///
    /// # Errors
    /// `UnknownChannel` if the channel was never created.
    pub fn start_conversation(
        &mut self,
        channel: &str,
        interface: &str,
        caster: &str,
        routing: ReplyRouting,
    ) -> Result<TalkContext, BusError> {
        let ch = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| BusError::UnknownChannel(channel.to_string()))?;
        let thread = ch.start_thread(caster, routing);
        Ok(TalkContext::new(channel, thread, interface))
    }
}
