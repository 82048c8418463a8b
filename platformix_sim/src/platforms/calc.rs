//! Calculator platform hosting `arith`.
//!
//! In mock mode results are computed in place. Otherwise every call goes
//! over a [`SubjectLink`] on its own thread and the reply comes back
//! through a ticket, so the bus keeps serving other conversations while the
//! subject thinks.

use crate::arith::{arith_interface, parse_response, ArithOp};
use crate::error::FactoryError;
use crate::factory::{Blueprint, Parts};
use platformix_core::message::ERRCODE_EXCEPTION;
use platformix_core::{Call, Completion, MethodTable, Outcome, Protocol, Worker, WorkerCx};
use platformix_env::SubjectLink;
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub type SharedLink = Arc<Mutex<Box<dyn SubjectLink>>>;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Calc {
    mock: bool,
    link: Option<SharedLink>,

    /// Upper bound of one exchange with the subject
    io_timeout: Duration,

    /// Calls answered or handed to the link
    pub calls: u64,
}

impl Calc {
    pub fn mock() -> Self {
        Self {
            mock: true,
            link: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
            calls: 0,
        }
    }

    pub fn linked(link: Box<dyn SubjectLink>) -> Self {
        Self {
            mock: false,
            link: Some(Arc::new(Mutex::new(link))),
            io_timeout: DEFAULT_IO_TIMEOUT,
            calls: 0,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    fn calculate(&mut self, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
        let op: ArithOp = call.message.method.parse()?;
        let a: Value = call.arg(0)?;
        let b: Value = call.arg(1)?;
        self.calls += 1;

        if self.mock {
            let outcome = match op.apply(&a, &b) {
                Ok(v) => Outcome::success(v),
                Err(e) => Outcome::failure_code(
                    format!("Platform {}: exception occurred on calculate: {:#}", call.cx.name(), e),
                    ERRCODE_EXCEPTION,
                ),
            };
            return Ok(outcome.into());
        }

        let Some(link) = self.link.clone() else {
            return Ok(Outcome::failure("No subject link").into());
        };
        let line = op.request_line(&a, &b);
        let timeout = self.io_timeout;
        let ticket = call.ticket();
        std::thread::spawn(move || {
            let response = {
                let mut link = match link.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                debug!("{} <- {}", link.describe(), line);
                link.exchange(&line, timeout)
            };
            let outcome = match response {
                Ok(text) => match parse_response(&text) {
                    Ok(v) => Outcome::success(v),
                    Err(e) => Outcome::failure(format!("{:#}", e)),
                },
                Err(e) => {
                    warn!("Exchange {:?} failed: {}", line, e);
                    Outcome::failure(format!("IO failed: {}", e))
                }
            };
            ticket.complete(outcome);
        });
        Ok(Completion::Deferred)
    }
}

impl Worker for Calc {
    fn start(&mut self, _cx: &mut WorkerCx<'_>) -> anyhow::Result<Outcome> {
        if !self.mock && self.link.is_none() {
            return Ok(Outcome::failure("No subject link"));
        }
        Ok(Outcome::success(Value::Null))
    }

    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "mock" => Some(Value::Bool(self.mock)),
            "calls" => Some(Value::from(self.calls)),
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

fn sum(w: &mut Calc, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.calculate(call)
}

fn sub(w: &mut Calc, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.calculate(call)
}

fn mult(w: &mut Calc, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.calculate(call)
}

fn div(w: &mut Calc, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.calculate(call)
}

fn power(w: &mut Calc, call: &mut Call<'_, '_>) -> anyhow::Result<Completion> {
    w.calculate(call)
}

pub fn arith_protocol() -> Result<Box<dyn Protocol>, platformix_core::BusError> {
    Ok(MethodTable::<Calc>::build(
        arith_interface(),
        &[("sum", sum), ("sub", sub), ("mult", mult), ("div", div), ("power", power)],
    )?
    .boxed())
}

/// Kwargs: `mock` (bool), `subject` (registered link name, default
/// `calculator`), `io_timeout` (seconds).
pub fn construct(blueprint: &Blueprint<'_>) -> Result<Parts, FactoryError> {
    let mock = blueprint.kwarg::<bool>("mock")?.unwrap_or(false);
    let mut calc = if mock {
        Calc::mock()
    } else {
        let subject = blueprint
            .kwarg::<String>("subject")?
            .unwrap_or_else(|| "calculator".to_string());
        Calc::linked(blueprint.subject(&subject)?)
    };
    if let Some(secs) = blueprint.kwarg::<f64>("io_timeout")? {
        let timeout = Duration::try_from_secs_f64(secs).map_err(|e| FactoryError::BadArgument {
            platform: blueprint.spec.name.clone(),
            argument: "io_timeout".to_string(),
            reason: e.to_string(),
        })?;
        calc = calc.with_io_timeout(timeout);
    }
    Ok(Parts::new(Box::new(calc)).with_protocol(arith_protocol()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::ARITH;
    use platformix_core::{Farm, FarmConfig, Message, ReplyRouting, PLATFORMIX, PLATFORMS_CHANNEL};
    use platformix_core::{Component, ComponentSpec, Replies};
    use platformix_env::{EnvError, LoopbackLink, ManualContext};
    use serde_json::json;

    fn farm_with(calc: Calc) -> Farm {
        let mut farm = Farm::new(FarmConfig::default(), ManualContext::shared(1));
        let c = Component::new(
            ComponentSpec::new("calc", "calc"),
            Box::new(calc),
            vec![arith_protocol().unwrap()],
            farm.config(),
        )
        .unwrap();
        farm.register(c).unwrap();
        farm
    }

    fn transact(farm: &mut Farm, channel: &str, message: Message) -> Replies {
        let ctx = farm
            .start_conversation(channel, &message.interface.clone(), ReplyRouting::default())
            .unwrap();
        farm.send(&ctx, message, None).unwrap().unwrap()
    }

    fn op(method: &str, a: Value, b: Value) -> Message {
        Message::call(ARITH, method).with_arg(a).with_arg(b)
    }

    #[test]
    fn test_mock_calculates() {
        let mut farm = farm_with(Calc::mock());
        transact(&mut farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        let r = transact(&mut farm, "@calc", op("power", json!(2), json!(9)));
        assert_eq!(r["calc"].value("value"), Some(&json!(512)));
        let r = transact(&mut farm, "@calc", op("div", json!(5), json!(0)));
        assert!(r["calc"].is_success());
        assert_eq!(r["calc"].value("value"), Some(&Value::Null));
    }

    #[test]
    fn test_mock_bad_operand_is_exception() {
        let mut farm = farm_with(Calc::mock());
        transact(&mut farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        let r = transact(&mut farm, "@calc", op("sum", json!("one"), json!(1)));
        assert_eq!(r["calc"].errcode(), Some(ERRCODE_EXCEPTION));
    }

    #[test]
    fn test_linked_answers_from_thread() {
        let mut farm = farm_with(Calc::linked(Box::new(crate::arith::calculator_link("app"))));
        transact(&mut farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        let r = transact(&mut farm, "@calc", op("div", json!(5), json!(3)));
        assert_eq!(r["calc"].value("value"), Some(&json!(5.0 / 3.0)));
        let r = transact(&mut farm, "@calc", op("div", json!(1), json!(0)));
        assert_eq!(r["calc"].value("value"), Some(&Value::Null));
        assert_eq!(farm.component("calc").unwrap().worker::<Calc>().unwrap().calls, 2);
    }

    #[test]
    fn test_link_failure_is_failure_reply() {
        let dead = LoopbackLink::new("dead", |_| Err(EnvError::closed("dead")));
        let mut farm = farm_with(Calc::linked(Box::new(dead)));
        transact(&mut farm, PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"));
        let r = transact(&mut farm, "@calc", op("sum", json!(1), json!(1)));
        assert!(r["calc"].is_failure());
        assert_eq!(r["calc"].state(), Some(&json!("IO failed: Link closed: dead")));
    }
}
