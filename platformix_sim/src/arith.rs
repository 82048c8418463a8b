//! The `arith` capability: two-operand arithmetic.
//!
//! Operands and results are JSON numbers. Integer operands stay integers
//! where the result is exact (`sum`, `sub`, `mult`, non-negative `power`);
//! `div` always yields a float and division by zero yields `null`.
//!
//! Out-of-process calculators speak a line protocol:
//!
//! ```text
//!   request:  "<method> <a> <b>"     e.g. "power 2 9"
//!   response: "<number>" | "None"    e.g. "512"
//! ```

use crate::rules::{CoverageRules, Prediction, ScoreboardRules};
use anyhow::{anyhow, bail};
use platformix_core::message::ERRCODE_EXCEPTION;
use platformix_core::{Interface, Kwargs, Message, Outcome, TalkContext};
use platformix_env::{EnvError, LoopbackLink};
use serde_json::{json, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const ARITH: &str = "arith";

pub fn arith_interface() -> Interface {
    Interface::new(ARITH, &["sum", "sub", "mult", "div", "power"])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Sum,
    Sub,
    Mult,
    Div,
    Power,
}

impl ArithOp {
    pub fn all() -> [ArithOp; 5] {
        [ArithOp::Sum, ArithOp::Sub, ArithOp::Mult, ArithOp::Div, ArithOp::Power]
    }

    pub fn method(&self) -> &'static str {
        match self {
            ArithOp::Sum => "sum",
            ArithOp::Sub => "sub",
            ArithOp::Mult => "mult",
            ArithOp::Div => "div",
            ArithOp::Power => "power",
        }
    }

    /// Applies the operation; `Ok(Value::Null)` for division by zero.
    pub fn apply(&self, a: &Value, b: &Value) -> anyhow::Result<Value> {
        let (a, b) = (operand(a)?, operand(b)?);
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            let exact = match self {
                ArithOp::Sum => x.checked_add(y),
                ArithOp::Sub => x.checked_sub(y),
                ArithOp::Mult => x.checked_mul(y),
                ArithOp::Power => u32::try_from(y).ok().and_then(|e| x.checked_pow(e)),
                ArithOp::Div => None,
            };
            if let Some(v) = exact {
                return Ok(Value::from(v));
            }
        }
        let (x, y) = (float(&a)?, float(&b)?);
        let r = match self {
            ArithOp::Sum => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mult => x * y,
            ArithOp::Div if y == 0.0 => return Ok(Value::Null),
            ArithOp::Div => x / y,
            ArithOp::Power => x.powf(y),
        };
        Number::from_f64(r)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("{} of {} and {} is not a finite number", self, x, y))
    }

    /// Request line for the calculator line protocol.
    pub fn request_line(&self, a: &Value, b: &Value) -> String {
        format!("{} {} {}", self.method(), a, b)
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method())
    }
}

impl FromStr for ArithOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArithOp::all()
            .into_iter()
            .find(|op| op.method() == s)
            .ok_or_else(|| anyhow!("Unknown arith operation: {}", s))
    }
}

fn operand(v: &Value) -> anyhow::Result<Number> {
    match v {
        Value::Number(n) => Ok(n.clone()),
        other => bail!("operand {} is not a number", other),
    }
}

fn float(n: &Number) -> anyhow::Result<f64> {
    n.as_f64().ok_or_else(|| anyhow!("operand {} can't be represented as float", n))
}

/// Parses a calculator response line.
pub fn parse_response(line: &str) -> anyhow::Result<Value> {
    let line = line.trim();
    if line == "None" {
        return Ok(Value::Null);
    }
    if let Ok(i) = line.parse::<i64>() {
        return Ok(Value::from(i));
    }
    let f: f64 = line
        .parse()
        .map_err(|_| anyhow!("Malformed calculator response: {:?}", line))?;
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("Calculator answered a non-finite number: {}", line))
}

/// Answers one request line of the calculator protocol.
pub fn answer_line(request: &str) -> anyhow::Result<String> {
    let mut parts = request.split_whitespace();
    let (Some(method), Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        bail!("expected \"<method> <a> <b>\", got {:?}", request);
    };
    let op: ArithOp = method.parse()?;
    let result = op.apply(&parse_response(a)?, &parse_response(b)?)?;
    Ok(match result {
        Value::Null => "None".to_string(),
        other => other.to_string(),
    })
}

/// In-process calculator behind the line protocol.
pub fn calculator_link(name: &str) -> LoopbackLink {
    LoopbackLink::new(name, |request| {
        answer_line(request).map_err(|e| EnvError::MalformedResponse(e.to_string()))
    })
}

/// Scoreboard rules recomputing every operation locally.
#[derive(Debug, Default)]
pub struct ArithScoreboard {
    /// Checked commands per method
    by_method: BTreeMap<String, u64>,
}

impl ScoreboardRules for ArithScoreboard {
    fn predict(&mut self, message: &Message) -> Prediction {
        let Ok(op) = message.method.parse::<ArithOp>() else {
            return Prediction::Unhandled("unsupported method! Check scoreboard against interface".to_string());
        };
        let [a, b] = message.args.as_slice() else {
            return Prediction::Unhandled("wrong format (expected 2 args)".to_string());
        };
        *self.by_method.entry(op.method().to_string()).or_default() += 1;
        match op.apply(a, b) {
            Ok(v) => Prediction::Expect(Outcome::success(v)),
            // the calculator raises on anything it can't compute
            Err(e) => Prediction::Expect(Outcome::failure_code(e.to_string(), ERRCODE_EXCEPTION)),
        }
    }

    fn stats(&self) -> Kwargs {
        let mut stats = Kwargs::new();
        stats.insert("by_method".into(), json!(self.by_method));
        stats
    }
}

/// Operand classes of the coverage bins.
const SIGNS: [&str; 3] = ["-", "0", "+"];

fn sign(v: &Value) -> Option<&'static str> {
    let x = v.as_f64()?;
    Some(if x < 0.0 {
        SIGNS[0]
    } else if x == 0.0 {
        SIGNS[1]
    } else {
        SIGNS[2]
    })
}

fn bin(op: ArithOp, a: &str, b: &str) -> String {
    format!("{}({},{})", op, a, b)
}

/// Coverage of every operation crossed with the signs of both operands.
#[derive(Debug, Default)]
pub struct ArithCoverage {
    hits: BTreeMap<String, u64>,
}

impl ArithCoverage {
    fn bins() -> Vec<String> {
        ArithOp::all()
            .into_iter()
            .flat_map(|op| SIGNS.iter().flat_map(move |a| SIGNS.iter().map(move |b| bin(op, a, b))))
            .collect()
    }
}

impl CoverageRules for ArithCoverage {
    fn sample(&mut self, _context: &TalkContext, message: &Message) -> bool {
        if message.is_reply() {
            return false;
        }
        let (Ok(op), [a, b]) = (message.method.parse::<ArithOp>(), message.args.as_slice()) else {
            return false;
        };
        let (Some(a), Some(b)) = (sign(a), sign(b)) else {
            return false;
        };
        *self.hits.entry(bin(op, a, b)).or_default() += 1;
        true
    }

    fn coverage(&self) -> (u64, u64) {
        (self.hits.len() as u64, Self::bins().len() as u64)
    }

    fn details(&self) -> Kwargs {
        let missing: Vec<String> = Self::bins().into_iter().filter(|b| !self.hits.contains_key(b)).collect();
        let mut details = Kwargs::new();
        details.insert("hits".into(), json!(self.hits));
        details.insert("missing".into(), json!(missing));
        details
    }
}
