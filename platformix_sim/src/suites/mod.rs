//! Built-in test suites.
//!
//! A test returns `Ok(false)` when the checked behaviour is wrong and raises
//! when it can't even get to the check.

pub mod arith;
pub mod chain;
pub mod smoke;

use crate::testenv::TestEnv;
use platformix_core::{FaultRule, Message, Outcome, Rule, PLATFORMIX};
use tracing::error;

fn report(what: &str) -> Message {
    Message::call(PLATFORMIX, "report").with_arg(what)
}

/// Canned failure for a future message.
fn fake_failure(state: &str) -> FaultRule {
    FaultRule::new(Outcome::failure(state))
}

/// Runs a transaction and tells whether its verdict is `want`.
fn expect_verdict(
    env: &mut TestEnv,
    channel: &str,
    message: Message,
    rules: &[Rule],
    want: bool,
    what: &str,
) -> anyhow::Result<bool> {
    let report = env.transaction_expecting(channel, message, rules, &[])?;
    if report.passed != want {
        error!(
            "{}: transaction {} but should have {}",
            what,
            if report.passed { "passed" } else { "failed" },
            if want { "passed" } else { "failed" }
        );
        return Ok(false);
    }
    Ok(true)
}
