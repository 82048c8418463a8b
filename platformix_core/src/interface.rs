//! Interface/Protocol binding.
//!
//! An [`Interface`] is a fixed method vocabulary. A [`MethodTable`] binds
//! every method of an interface to a statically typed function of one
//! concrete worker type; the table is checked when it is built, so an
//! unbound method is a construction error and never a runtime lookup miss.
//!
//! ```text
//!   Message{interface, method}
//!          │
//!          ▼
//!   Interface::supports ── no ──► not accepted
//!          │ yes
//!          ▼
//!   MethodTable<W>::invoke ──► fn(&mut W, &mut Call) -> Completion
//! ```

use crate::context::TalkContext;
use crate::error::BusError;
use crate::mailbox::Ticket;
use crate::message::{Kwargs, Message, Outcome, TESTING_METHOD};
use crate::worker::{Worker, WorkerCx};
use anyhow::{anyhow, Context as _};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Named method vocabulary of one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    id: String,
    methods: Vec<&'static str>,
}

impl Interface {
    pub fn new(id: impl Into<String>, methods: &[&'static str]) -> Self {
        Self {
            id: id.into(),
            methods: methods.to_vec(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn methods(&self) -> &[&'static str] {
        &self.methods
    }

    pub fn declares(&self, method: &str) -> bool {
        self.methods.iter().any(|m| *m == method)
    }

    /// Whether `message` is a call this interface understands.
    ///
    /// The reserved testing method is understood by every interface.
    pub fn supports(&self, message: &Message) -> bool {
        !message.is_reply()
            && message.interface == self.id
            && (message.method == TESTING_METHOD || self.declares(&message.method))
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.id, self.methods.join(", "))
    }
}

/// How a protocol method finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Terminal reply to send now
    Reply(Outcome),

    /// The reply will be sent later, from a continuation or a ticket
    Deferred,
}

impl From<Outcome> for Completion {
    fn from(outcome: Outcome) -> Self {
        Completion::Reply(outcome)
    }
}

/// One inbound call as seen by a method implementation.
pub struct Call<'a, 'b> {
    pub context: &'a TalkContext,
    pub message: &'a Message,
    pub cx: &'a mut WorkerCx<'b>,
}

impl<'a, 'b> Call<'a, 'b> {
    pub fn args(&self) -> &[Value] {
        &self.message.args
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.message.kwargs
    }

    /// Positional argument `idx` deserialized as `T`.
    pub fn arg<T: DeserializeOwned>(&self, idx: usize) -> anyhow::Result<T> {
        decode_arg(self.message, idx)
    }

    /// Optional positional argument; absent and `null` both give `None`.
    pub fn opt_arg<T: DeserializeOwned>(&self, idx: usize) -> anyhow::Result<Option<T>> {
        match self.message.args.get(idx) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(idx).map(Some),
        }
    }

    /// Sends a progress notify in the call's context.
    pub fn notify(&mut self, state: &str) {
        self.cx.notify(self.context, state);
    }

    /// Issues a ticket for answering this call from another thread.
    pub fn ticket(&self) -> Ticket {
        self.cx.ticket(self.context)
    }
}

/// Positional argument `idx` of `message` deserialized as `T`.
pub fn decode_arg<T: DeserializeOwned>(message: &Message, idx: usize) -> anyhow::Result<T> {
    let raw = message
        .args
        .get(idx)
        .ok_or_else(|| anyhow!("{} expects argument #{}", message.method, idx))?;
    serde_json::from_value(raw.clone()).with_context(|| format!("{} argument #{} has wrong type", message.method, idx))
}

/// Function implementing one method for worker type `W`.
pub type MethodFn<W> = fn(&mut W, &mut Call<'_, '_>) -> anyhow::Result<Completion>;

/// Binding of an interface to a concrete component.
pub trait Protocol {
    fn interface(&self) -> &Interface;

    /// Methods auto-fail with "Wasn't started!" while the owner isn't running.
    fn requires_running(&self) -> bool {
        true
    }

    /// Whether this protocol can drive `worker`.
    fn accepts_worker(&self, worker: &dyn Worker) -> bool;

    /// Runs the method named by `call.message`.
    fn invoke(&self, worker: &mut dyn Worker, call: &mut Call<'_, '_>) -> anyhow::Result<Completion>;
}

/// Method table for worker type `W`, complete for its interface.
pub struct MethodTable<W> {
    interface: Interface,
    methods: HashMap<&'static str, MethodFn<W>>,
}

impl<W: Worker> MethodTable<W> {
    /// Builds the table.
    ///
    /// # Errors
    /// `UndeclaredMethod` for a binding the interface doesn't declare,
    /// `UnboundMethod` for a declared method left without a binding.
    pub fn build(interface: Interface, bindings: &[(&'static str, MethodFn<W>)]) -> Result<Self, BusError> {
        let mut methods = HashMap::new();
        for (name, f) in bindings {
            if !interface.declares(name) {
                return Err(BusError::UndeclaredMethod {
                    interface: interface.id().to_string(),
                    method: name.to_string(),
                });
            }
            methods.insert(*name, *f);
        }
        if let Some(missing) = interface.methods().iter().find(|m| !methods.contains_key(*m)) {
            return Err(BusError::UnboundMethod {
                interface: interface.id().to_string(),
                method: missing.to_string(),
            });
        }
        Ok(Self { interface, methods })
    }

    /// Boxes the table for a component's protocol list.
    pub fn boxed(self) -> Box<dyn Protocol> {
        Box::new(self)
    }
}

impl<W: Worker> Protocol for MethodTable<W> {
    fn interface(&self) -> &Interface {
        &self.interface
    }

    fn accepts_worker(&self, worker: &dyn Worker) -> bool {
        worker.as_any().is::<W>()
    }

    fn invoke(&self, worker: &mut dyn Worker, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let method = call.message.method.as_str();
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| anyhow!("method {} is not implemented", method))?;
        let worker = worker
            .as_any_mut()
            .downcast_mut::<W>()
            .ok_or_else(|| anyhow!("{} is bound to another worker type", self.interface.id()))?;
        f(worker, call)
    }
}

impl<W> fmt::Debug for MethodTable<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable").field("interface", &self.interface).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct Adder {
        calls: usize,
    }

    impl Worker for Adder {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Other;

    impl Worker for Other {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn add(w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        w.calls += 1;
        let a: i64 = call.arg(0)?;
        let b: i64 = call.arg(1)?;
        Ok(Outcome::success(a + b).into())
    }

    fn neg(_w: &mut Adder, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let a: i64 = call.arg(0)?;
        Ok(Outcome::success(-a).into())
    }

    fn iface() -> Interface {
        Interface::new("calc", &["add", "neg"])
    }

    #[test]
    fn test_supports() {
        let i = iface();
        assert!(i.supports(&Message::call("calc", "add")));
        assert!(i.supports(&Message::call("calc", TESTING_METHOD)));
        assert!(!i.supports(&Message::call("calc", "mul")));
        assert!(!i.supports(&Message::call("arith", "add")));
        assert!(!i.supports(&Message::success(1)));
    }

    #[test]
    fn test_unbound_method_rejected() {
        let r = MethodTable::<Adder>::build(iface(), &[("add", add)]);
        assert!(matches!(r, Err(BusError::UnboundMethod { ref method, .. }) if method == "neg"));
    }

    #[test]
    fn test_undeclared_method_rejected() {
        let r = MethodTable::<Adder>::build(iface(), &[("add", add), ("neg", neg), ("mul", add)]);
        assert!(matches!(r, Err(BusError::UndeclaredMethod { ref method, .. }) if method == "mul"));
    }

    #[test]
    fn test_worker_type_checked() {
        let table = MethodTable::<Adder>::build(iface(), &[("add", add), ("neg", neg)]).unwrap();
        assert!(table.accepts_worker(&Adder { calls: 0 }));
        assert!(!table.accepts_worker(&Other));
        assert_eq!(table.interface().id(), "calc");
    }
}
