//! Calculator checks, against a mocked `calc` and through the sequencer.

use crate::arith::{ArithOp, ARITH};
use crate::platforms::sequencer::{SEQUENCER, SEQUENCER_CHANNEL};
use crate::runner::{Expect, TestCase};
use crate::testenv::TestEnv;
use anyhow::{bail, Context};
use platformix_core::{Message, PLATFORMIX};
use serde_json::{json, Value};
use tracing::{error, info};

const CALC: &str = "calc";
const SCOREBOARD: &str = "scoreboard";
const COVERAGE: &str = "coverage";

pub fn mock_tests() -> Vec<TestCase> {
    vec![
        TestCase::new("test_sum", |env| check(env, ArithOp::Sum, json!(1), json!(1), json!(2))),
        TestCase::new("test_sub", |env| check(env, ArithOp::Sub, json!(5), json!(2), json!(3))),
        TestCase::new("test_mult", |env| check(env, ArithOp::Mult, json!(2), json!(2), json!(4))),
        TestCase::new("test_div", |env| check(env, ArithOp::Div, json!(5), json!(3), json!(5.0 / 3.0))),
        TestCase::new("test_power", |env| check(env, ArithOp::Power, json!(2), json!(9), json!(512))),
        TestCase::new("test_div_zero", |env| check(env, ArithOp::Div, json!(5), json!(0), Value::Null)),
        TestCase::new("should_fail", |env| check(env, ArithOp::Sum, json!(2), json!(3), json!(6)))
            .expecting(Expect::Fail),
    ]
}

pub fn sequence_tests() -> Vec<TestCase> {
    vec![
        TestCase::new("test_sequence", |env| {
            let runs = env
                .generic("runs")
                .and_then(Value::as_u64)
                .context("generic runs is not set")?;
            sequence(env, Some(runs))
        }),
        TestCase::new("test_sequence_default_runs", |env| sequence(env, None)),
        TestCase::new("test_break_idle", |env| {
            Ok(env
                .transaction(SEQUENCER_CHANNEL, Message::call(SEQUENCER, "break"))?
                .passed)
        }),
        TestCase::new("test_scoreboard_clean", scoreboard_clean),
        TestCase::new("test_coverage_sampled", coverage_sampled),
    ]
}

/// Reads a property of `platform` through its personal channel.
fn property(env: &mut TestEnv, platform: &str, name: &str) -> anyhow::Result<Value> {
    let r = env.transaction(&format!("@{}", platform), Message::call(PLATFORMIX, "get").with_arg(name))?;
    r.replies
        .get(platform)
        .and_then(|m| m.value(name))
        .cloned()
        .with_context(|| format!("{} didn't report {}", platform, name))
}

fn scoreboard_clean(env: &mut TestEnv) -> anyhow::Result<bool> {
    if !sequence(env, Some(5))? {
        return Ok(false);
    }
    let stats = property(env, SCOREBOARD, "scoreboard")?;
    let count = |key: &str| stats.get(key).and_then(Value::as_u64);
    info!("scoreboard: {}", stats);
    let ok = count("requests").map_or(false, |n| n >= 5)
        && count("responses") == count("requests")
        && count("success") == count("responses")
        && count("errors") == Some(0)
        && count("unhandled") == Some(0)
        && count("queued_requests") == Some(0);
    if !ok {
        error!("scoreboard found problems: {}", property(env, SCOREBOARD, "scoreboard_data")?);
    }
    Ok(ok)
}

fn coverage_sampled(env: &mut TestEnv) -> anyhow::Result<bool> {
    if !sequence(env, Some(10))? {
        return Ok(false);
    }
    let coverage: (u64, u64) = serde_json::from_value(property(env, COVERAGE, "coverage")?)?;
    let percent = property(env, COVERAGE, "coverage_percent")?;
    info!("coverage: {} of {} bins ({}%)", coverage.0, coverage.1, percent);
    Ok(coverage.0 > 0 && coverage.0 <= coverage.1)
}

fn check(env: &mut TestEnv, op: ArithOp, a: Value, b: Value, expected: Value) -> anyhow::Result<bool> {
    let channel = format!("@{}", CALC);
    let message = Message::call(ARITH, op.method()).with_args([a.clone(), b.clone()]);
    let r = env.transaction(&channel, message)?;
    if !r.passed {
        bail!("Failed to complete transaction: {}", r.failures.join("; "));
    }
    let got = r.replies.get(CALC).and_then(|m| m.value("value")).cloned();
    if got.as_ref() != Some(&expected) {
        error!("{} {} {} = {:?}, expected {}", a, op, b, got, expected);
        return Ok(false);
    }
    Ok(true)
}

fn sequence(env: &mut TestEnv, runs: Option<u64>) -> anyhow::Result<bool> {
    let mut message = Message::call(SEQUENCER, "run");
    if let Some(runs) = runs {
        message = message.with_arg(runs);
    }
    let r = env.transaction(SEQUENCER_CHANNEL, message)?;
    if !r.passed {
        bail!("Sequence failed: {}", r.failures.join("; "));
    }
    let mut ok = true;
    for (name, reply) in &r.replies {
        let completed = reply.value("runs_completed").and_then(Value::as_u64);
        let mismatches = reply.value("mismatches").and_then(Value::as_u64);
        info!("{}: {:?} runs completed, {:?} mismatches", name, completed, mismatches);
        if let Some(runs) = runs {
            if completed != Some(runs) {
                error!("{} completed {:?} of {} runs", name, completed, runs);
                ok = false;
            }
        }
        if reply.value("breaked") != Some(&json!(false)) || mismatches != Some(0) {
            ok = false;
        }
    }
    Ok(ok)
}
