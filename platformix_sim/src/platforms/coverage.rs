//! Coverage platform: samples overheard messages into the bins of a rule
//! set.
//!
//! Read through `platformix.get`: `coverage` is `[covered, total]`,
//! `coverage_percent` the share of covered bins and `coverage_data` the
//! rule set's records.

use crate::error::FactoryError;
use crate::factory::{Blueprint, Parts};
use crate::platforms::scoreboard::Tap;
use crate::rules::{coverage_value, percent, CoverageRules};
use platformix_core::{Kwargs, Message, TalkContext, Worker};
use serde_json::Value;
use std::any::Any;

/// Channel every coverage collector joins.
pub const COVERAGE_CHANNEL: &str = "#coverage";

pub struct Coverage {
    tap: Tap,
    rules: Box<dyn CoverageRules>,

    /// Messages the rule set took
    pub samples: u64,
}

impl Coverage {
    pub fn new(tap: Tap, rules: Box<dyn CoverageRules>) -> Self {
        Self { tap, rules, samples: 0 }
    }

    /// Covered bins and the total number of bins.
    pub fn coverage(&self) -> (u64, u64) {
        self.rules.coverage()
    }
}

impl Worker for Coverage {
    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "coverage" => Some(coverage_value(self.coverage())),
            "coverage_percent" => Some(Value::from(percent(self.coverage()))),
            "coverage_data" => Some(Value::Object(self.rules.details())),
            "samples" => Some(Value::from(self.samples)),
            _ => None,
        }
    }

    fn observe(&mut self, context: &TalkContext, message: &Message) -> bool {
        if !self.tap.taps(context) || !self.rules.sample(context, message) {
            return false;
        }
        self.samples += 1;
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Kwargs: `channel`, `interface`, `rules`, `rules_kwargs`.
pub fn construct(blueprint: &Blueprint<'_>) -> Result<Parts, FactoryError> {
    let tap = Tap::new(
        blueprint.required::<String>("channel")?,
        blueprint.required::<String>("interface")?,
    );
    let rules_name: String = blueprint.required("rules")?;
    let rules_kwargs = blueprint.kwarg::<Kwargs>("rules_kwargs")?.unwrap_or_default();
    let rules = blueprint.rules().coverage(&rules_name, &rules_kwargs)?;
    let channel = tap.channel.clone();
    Ok(Parts::new(Box::new(Coverage::new(tap, rules)))
        .subscribe(COVERAGE_CHANNEL)
        .subscribe(channel))
}
