//! Dependency graph and ordering of start and stop along a chain of
//! platforms: `platform_b` waits for `platform_a`, `platform_c` is a
//! subplatform of `platform_b`.

use super::{expect_verdict, fake_failure};
use crate::runner::TestCase;
use crate::testenv::TestEnv;
use anyhow::Context;
use platformix_core::{Message, Rule, PLATFORMIX, PLATFORMS_CHANNEL};
use serde_json::json;
use tracing::error;

const A: &str = "platform_a";
const B: &str = "platform_b";
const C: &str = "platform_c";

pub fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new("[chain] graph check", graph),
        TestCase::new("[chain] stop waits for dependents", stop_waits),
        TestCase::new("[chain] start failure aborts dependents", start_failure),
    ]
}

fn graph(env: &mut TestEnv) -> anyhow::Result<bool> {
    let farm = env.farm();
    let a = farm.component(A).context("platform_a is missing")?;
    let b = farm.component(B).context("platform_b is missing")?;
    let c = farm.component(C).context("platform_c is missing")?;
    if a.depended() != [B.to_string()] || b.subplatforms() != [C.to_string()] {
        error!("Unexpected graph: {} depended {:?}, {} subplatforms {:?}", A, a.depended(), B, b.subplatforms());
        return Ok(false);
    }
    if !c.wait_list().iter().any(|w| w == B) {
        error!("{} doesn't wait for its parent", C);
        return Ok(false);
    }

    let r = env.transaction(PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "get").with_arg("state"))?;
    let running = r
        .replies
        .values()
        .all(|m| m.value("state") == Some(&json!("running")));
    Ok(r.passed && running && r.participants.len() == 3)
}

fn stop_waits(env: &mut TestEnv) -> anyhow::Result<bool> {
    // nobody tells platform_b to stop, so platform_a gives up waiting
    let started = env.farm().clock().now();
    let r = env.transaction(&format!("@{}", A), Message::call(PLATFORMIX, "stop"))?;
    let waited = env.farm().clock().now().saturating_sub(started);
    let limit = env
        .farm()
        .component(A)
        .context("platform_a is missing")?
        .stop_max_wait();
    if !r.passed {
        error!("Stop of {} failed: {}", A, r.failures.join("; "));
        return Ok(false);
    }
    if waited < limit {
        error!("{} stopped after {:?}, before its stop_max_wait {:?}", A, waited, limit);
        return Ok(false);
    }
    Ok(!env.farm().is_running(A)? && env.farm().is_running(B)? && env.farm().is_running(C)?)
}

fn start_failure(env: &mut TestEnv) -> anyhow::Result<bool> {
    env.stop_platforms()?;
    let fake = fake_failure("Failed by intent (fake_next_op, start of the chain root)")
        .on_channel(PLATFORMS_CHANNEL)
        .on_message(Message::call(PLATFORMIX, "start"));
    if !expect_verdict(env, &format!("@{}", A), fake.into_message(PLATFORMIX), &[Rule::all_success()], true, "set fake_next_op")? {
        return Ok(false);
    }
    let r = env.transaction_expecting(PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"), &[Rule::fail([A, B, C])], &[])?;
    if !r.passed {
        error!("Chain start should fail everywhere: {}", r.failures.join("; "));
        return Ok(false);
    }
    for (name, cause) in [(B, A), (C, B)] {
        let expected = json!(format!("Aborting start due to platform {} failed to start", cause));
        let state = r.replies.get(name).and_then(|m| m.state());
        if state != Some(&expected) {
            error!("{} replied {:?}, expected {}", name, state, expected);
            return Ok(false);
        }
    }
    Ok(env.farm().all_stopped())
}
