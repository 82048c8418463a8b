//! Expectation evaluator: judges the replies harvested by a transaction.
//!
//! Rules are checked in order. `all`, `any` and `others` claim the
//! participants they looked at, and so does an explicit name list, so a
//! later `others` only sees what no earlier rule named. `none` claims
//! nothing.
//!
//! Negating a rule flips the outcome it checks for: `not all success`
//! requires every participant to have failed.

use crate::farm::{Replies, ENVIRONMENT};
use crate::message::Message;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Who a rule is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    All,
    Any,
    None,
    /// Participants no earlier rule claimed
    Others,
    Names(Vec<String>),
}

/// Outcome a rule checks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    Success,
    Fail,
}

/// One expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub selector: Selector,
    pub outcome: Expected,
    pub negate: bool,
}

impl Rule {
    pub fn new(selector: Selector, outcome: Expected) -> Self {
        Self {
            selector,
            outcome,
            negate: false,
        }
    }

    /// The same rule checking the opposite outcome.
    pub fn not(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn all_success() -> Self {
        Self::new(Selector::All, Expected::Success)
    }

    pub fn all_fail() -> Self {
        Self::new(Selector::All, Expected::Fail)
    }

    pub fn any_success() -> Self {
        Self::new(Selector::Any, Expected::Success)
    }

    pub fn any_fail() -> Self {
        Self::new(Selector::Any, Expected::Fail)
    }

    pub fn none_success() -> Self {
        Self::new(Selector::None, Expected::Success)
    }

    pub fn none_fail() -> Self {
        Self::new(Selector::None, Expected::Fail)
    }

    pub fn others_success() -> Self {
        Self::new(Selector::Others, Expected::Success)
    }

    pub fn others_fail() -> Self {
        Self::new(Selector::Others, Expected::Fail)
    }

    pub fn success<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Selector::Names(names.into_iter().map(Into::into).collect()), Expected::Success)
    }

    pub fn fail<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Selector::Names(names.into_iter().map(Into::into).collect()), Expected::Fail)
    }

    /// Whether the rule wants successes once negation is applied.
    fn wants_success(&self) -> bool {
        (self.outcome == Expected::Success) != self.negate
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "not ")?;
        }
        match &self.selector {
            Selector::All => write!(f, "all")?,
            Selector::Any => write!(f, "any")?,
            Selector::None => write!(f, "none")?,
            Selector::Others => write!(f, "others")?,
            Selector::Names(names) => write!(f, "[{}]", names.join(", "))?,
        }
        match self.outcome {
            Expected::Success => write!(f, " success"),
            Expected::Fail => write!(f, " fail"),
        }
    }
}

/// Verdict on a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub passed: bool,

    /// Repliers considered, sorted
    pub participants: Vec<String>,

    /// Participants whose last reply was a notify
    pub in_progress: Vec<String>,

    /// Why the verdict is negative
    pub failures: Vec<String>,

    #[serde(skip)]
    pub replies: Replies,
}

impl TransactionReport {
    /// Short text of each participant's last reply.
    pub fn summaries(&self) -> BTreeMap<String, String> {
        self.replies
            .iter()
            .map(|(name, m)| (name.clone(), m.summary()))
            .collect()
    }
}

/// Judges `replies` against `rules`.
///
/// The environment and `ignore` are never participants. An empty rule list
/// passes once the hard checks (someone answered, nobody left in progress)
/// do.
pub fn evaluate(replies: Replies, rules: &[Rule], ignore: &[String]) -> TransactionReport {
    let participants: Vec<String> = replies
        .keys()
        .filter(|name| name.as_str() != ENVIRONMENT && !ignore.contains(*name))
        .cloned()
        .collect();
    let in_progress: Vec<String> = participants
        .iter()
        .filter(|name| replies[name.as_str()].is_notify())
        .cloned()
        .collect();

    let mut failures = Vec::new();
    if participants.is_empty() {
        failures.push("no participants replied".to_string());
    }
    if !in_progress.is_empty() {
        failures.push(format!("still in progress: {}", in_progress.join(", ")));
    }
    if failures.is_empty() {
        if rules.is_empty() {
            warn!("no expectations given, only hard checks applied");
        }
        failures = check_rules(&replies, &participants, rules);
    }

    TransactionReport {
        passed: failures.is_empty(),
        participants,
        in_progress,
        failures,
        replies,
    }
}

fn check_rules(replies: &Replies, participants: &[String], rules: &[Rule]) -> Vec<String> {
    let matches = |name: &str, rule: &Rule| {
        let reply: Option<&Message> = replies.get(name);
        reply.map_or(false, |m| {
            if rule.wants_success() {
                m.is_success()
            } else {
                m.is_failure()
            }
        })
    };

    let mut others: Vec<String> = participants.to_vec();
    let mut failures = Vec::new();
    for rule in rules {
        let violators: Vec<String> = match &rule.selector {
            Selector::All => {
                others.clear();
                participants.iter().filter(|p| !matches(p.as_str(), rule)).cloned().collect()
            }
            Selector::Any => {
                others.clear();
                if participants.iter().any(|p| matches(p.as_str(), rule)) {
                    Vec::new()
                } else {
                    participants.to_vec()
                }
            }
            Selector::None => participants.iter().filter(|p| matches(p.as_str(), rule)).cloned().collect(),
            Selector::Others => {
                let violators = others.iter().filter(|p| !matches(p.as_str(), rule)).cloned().collect();
                others.clear();
                violators
            }
            Selector::Names(names) => {
                others.retain(|p| !names.contains(p));
                names
                    .iter()
                    .filter(|n| !participants.contains(*n) || !matches(n.as_str(), rule))
                    .cloned()
                    .collect()
            }
        };
        if !violators.is_empty() {
            failures.push(format!("{}: violated by {}", rule, violators.join(", ")));
        }
    }
    failures
}
