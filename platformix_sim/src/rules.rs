//! Checking rules plugged into scoreboard and coverage platforms.
//!
//! A scoreboard turns every observed command into the reply it must
//! produce and compares the actual reply against it. A coverage collector
//! samples observed messages into bins. Both platforms stay generic; what
//! a command means lives in a rule set picked by name from a
//! [`RulesRegistry`].
//!
//! ```text
//!   description: {"rules": "arith_all", "rules_kwargs": {...}}
//!        │
//!        ▼
//!   RulesRegistry ──► Box<dyn ScoreboardRules> / Box<dyn CoverageRules>
//!        │ unknown name
//!        ▼
//!   FactoryError::UnknownRules
//! ```

use crate::arith::{ArithCoverage, ArithScoreboard};
use crate::error::FactoryError;
use platformix_core::{Kwargs, Message, Outcome, TalkContext};
use serde_json::Value;
use std::collections::HashMap;

/// What a scoreboard rule set makes of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// The reply the command must produce
    Expect(Outcome),

    /// The command can't be checked
    Unhandled(String),
}

/// Reference model of a scoreboard.
pub trait ScoreboardRules {
    /// Predicts the reply to `message`.
    fn predict(&mut self, message: &Message) -> Prediction;

    /// Whether `got` is the reply `expected` describes.
    ///
    /// Successes compare their values, failures their error codes.
    fn matches(&self, expected: &Outcome, got: &Message) -> bool {
        match expected {
            Outcome::Success { .. } => got.is_success() && expected.to_message().reply_data() == got.reply_data(),
            Outcome::Failure { errcode, .. } => got.is_failure() && got.errcode() == Some(*errcode),
        }
    }

    /// Summary statistics of the rule set, merged into the scoreboard's own.
    fn stats(&self) -> Kwargs {
        Kwargs::new()
    }

    /// Full records of the rule set.
    fn details(&self) -> Kwargs {
        Kwargs::new()
    }
}

/// Sampling model of a coverage collector.
pub trait CoverageRules {
    /// Samples one observed message; returns whether it was taken.
    fn sample(&mut self, context: &TalkContext, message: &Message) -> bool;

    /// Covered bins and the total number of bins.
    fn coverage(&self) -> (u64, u64);

    /// Full records of the rule set.
    fn details(&self) -> Kwargs {
        Kwargs::new()
    }
}

pub type ScoreboardMaker = fn(&Kwargs) -> Result<Box<dyn ScoreboardRules>, FactoryError>;
pub type CoverageMaker = fn(&Kwargs) -> Result<Box<dyn CoverageRules>, FactoryError>;

/// Named rule sets.
pub struct RulesRegistry {
    scoreboards: HashMap<String, ScoreboardMaker>,
    coverage: HashMap<String, CoverageMaker>,
}

impl RulesRegistry {
    pub fn empty() -> Self {
        Self {
            scoreboards: HashMap::new(),
            coverage: HashMap::new(),
        }
    }

    /// Registry knowing the built-in `arith_all` rule sets.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_scoreboard("arith_all", |_| Ok(Box::new(ArithScoreboard::default())));
        registry.register_coverage("arith_all", |_| Ok(Box::new(ArithCoverage::default())));
        registry
    }

    pub fn register_scoreboard(&mut self, name: impl Into<String>, maker: ScoreboardMaker) {
        self.scoreboards.insert(name.into(), maker);
    }

    pub fn register_coverage(&mut self, name: impl Into<String>, maker: CoverageMaker) {
        self.coverage.insert(name.into(), maker);
    }

    /// # Errors
    /// `UnknownRules` if nothing is registered as `name`, or whatever the
    /// constructor rejects in `kwargs`.
    pub fn scoreboard(&self, name: &str, kwargs: &Kwargs) -> Result<Box<dyn ScoreboardRules>, FactoryError> {
        let maker = self
            .scoreboards
            .get(name)
            .ok_or_else(|| FactoryError::UnknownRules(name.to_string()))?;
        maker(kwargs)
    }

    /// # Errors
    /// Same as [`RulesRegistry::scoreboard`].
    pub fn coverage(&self, name: &str, kwargs: &Kwargs) -> Result<Box<dyn CoverageRules>, FactoryError> {
        let maker = self
            .coverage
            .get(name)
            .ok_or_else(|| FactoryError::UnknownRules(name.to_string()))?;
        maker(kwargs)
    }
}

impl Default for RulesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentage of covered bins, 0 when there are no bins.
pub fn percent((covered, total): (u64, u64)) -> f64 {
    if total == 0 {
        return 0.0;
    }
    covered as f64 * 100.0 / total as f64
}

/// `(covered, total)` as a JSON pair.
pub(crate) fn coverage_value(coverage: (u64, u64)) -> Value {
    Value::from(vec![coverage.0, coverage.1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_rules() {
        let registry = RulesRegistry::new();
        assert!(matches!(
            registry.scoreboard("telepathy", &Kwargs::new()),
            Err(FactoryError::UnknownRules(ref n)) if n == "telepathy"
        ));
        assert!(matches!(
            registry.coverage("telepathy", &Kwargs::new()),
            Err(FactoryError::UnknownRules(_))
        ));
        assert!(RulesRegistry::empty().scoreboard("arith_all", &Kwargs::new()).is_err());
    }

    #[test]
    fn test_default_matching() {
        let rules = RulesRegistry::new().scoreboard("arith_all", &Kwargs::new()).unwrap();
        let expected = Outcome::success(json!(5));
        assert!(rules.matches(&expected, &Message::success(5)));
        assert!(!rules.matches(&expected, &Message::success(6)));
        assert!(!rules.matches(&expected, &Outcome::failure("x").to_message()));

        let failed = Outcome::failure_code("whatever", -2);
        assert!(rules.matches(&failed, &Outcome::failure_code("other text", -2).to_message()));
        assert!(!rules.matches(&failed, &Outcome::failure("x").to_message()));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent((0, 0)), 0.0);
        assert_eq!(percent((9, 45)), 20.0);
        assert_eq!(coverage_value((1, 2)), json!([1, 2]));
    }
}
