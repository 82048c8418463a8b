//! Mailbox through which other threads post replies into the bus.
//!
//! A worker that can't answer synchronously (an I/O adapter waiting on a
//! subject) takes a [`Ticket`] for the conversation and completes it from
//! whatever thread it likes. The drain loop polls the mailbox without
//! blocking and keeps polling while tickets are outstanding, for at most
//! `FarmConfig::ticket_wait` without progress.

use crate::context::TalkContext;
use crate::message::{Message, Outcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A reply posted from outside the bus thread.
#[derive(Debug, Clone)]
pub struct Posted {
    pub context: TalkContext,
    pub message: Message,
    terminal: bool,
}

/// Per-component receiving end.
#[derive(Debug)]
pub struct Mailbox {
    tx: UnboundedSender<Posted>,
    rx: UnboundedReceiver<Posted>,
    in_flight: Arc<AtomicUsize>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx,
            rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Issues a ticket for answering `context` later.
    pub fn ticket(&self, context: TalkContext) -> Ticket {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ticket {
            context,
            tx: self.tx.clone(),
            done: false,
        }
    }

    /// Tickets issued and not yet answered terminally.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Takes everything posted so far without blocking.
    pub fn drain(&mut self) -> Vec<Posted> {
        let mut out = Vec::new();
        while let Ok(posted) = self.rx.try_recv() {
            if posted.terminal {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            out.push(posted);
        }
        out
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Right to answer one conversation from another thread.
///
/// Dropping an unanswered ticket answers with a failure so the bus never
/// waits on a reply that can't come.
#[derive(Debug)]
pub struct Ticket {
    context: TalkContext,
    tx: UnboundedSender<Posted>,
    done: bool,
}

impl Ticket {
    pub fn context(&self) -> &TalkContext {
        &self.context
    }

    /// Posts a progress notify.
    pub fn notify(&self, state: &str) -> bool {
        self.tx
            .send(Posted {
                context: self.context.clone(),
                message: Message::notify(state),
                terminal: false,
            })
            .is_ok()
    }

    /// Posts the terminal reply; returns false if the bus is gone.
    pub fn complete(mut self, outcome: Outcome) -> bool {
        self.done = true;
        self.tx
            .send(Posted {
                context: self.context.clone(),
                message: outcome.to_message(),
                terminal: true,
            })
            .is_ok()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.tx.send(Posted {
                context: self.context.clone(),
                message: Outcome::failure("reply ticket dropped without answer").to_message(),
                terminal: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TalkContext {
        TalkContext::new("@calc", 0, "arith")
    }

    #[test]
    fn test_ticket_from_other_thread() {
        let mut mb = Mailbox::new();
        let ticket = mb.ticket(ctx());
        assert_eq!(mb.in_flight(), 1);

        let handle = std::thread::spawn(move || {
            ticket.notify("working");
            ticket.complete(Outcome::success(5))
        });
        assert!(handle.join().unwrap());

        let posted = mb.drain();
        assert_eq!(posted.len(), 2);
        assert!(posted[0].message.is_notify());
        assert_eq!(posted[1].message.value("value"), Some(&json!(5)));
        assert_eq!(mb.in_flight(), 0);
    }

    #[test]
    fn test_dropped_ticket_fails() {
        let mut mb = Mailbox::new();
        drop(mb.ticket(ctx()));
        let posted = mb.drain();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].message.is_failure());
        assert_eq!(mb.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_until_drained() {
        let mut mb = Mailbox::new();
        let t = mb.ticket(ctx());
        t.complete(Outcome::success(1));
        // Not consumed yet: the drain loop must still see it as pending
        assert_eq!(mb.in_flight(), 1);
        mb.drain();
        assert_eq!(mb.in_flight(), 0);
    }
}
