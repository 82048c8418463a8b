//! Self test of the lifecycle protocol, the evaluator and the test
//! environment, run against three `platformix` platforms.

use super::{expect_verdict, fake_failure, report};
use crate::runner::{Expect, TestCase};
use crate::testenv::TestEnv;
use anyhow::bail;
use platformix_core::{Message, Rule, PLATFORMIX, PLATFORMS_CHANNEL, VOID_CHANNEL};
use serde_json::{json, Value};
use tracing::error;

/// The platform the checks single out.
const TARGET: &str = "platform_b";

fn target_channel() -> String {
    format!("@{}", TARGET)
}

pub fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new("[sanity check]", sanity_check),
        TestCase::new("[single fail] success check", single_fail),
        TestCase::new("[any success] fail check", any_success_fail),
        TestCase::new("[not(any success)] fail check", not_any_success),
        TestCase::new("[any fail] success check", any_fail_success),
        TestCase::new("[no response] fail check", no_response),
        TestCase::new("[set/get] complex check", set_get),
        TestCase::new("[call] check", call),
        TestCase::new("[exception_test]", |_| {
            bail!("Assertion error occurred AS EXPECTED. Ensure platforms are stopped correctly")
        })
        .expecting(Expect::Exception),
    ]
}

fn sanity_check(env: &mut TestEnv) -> anyhow::Result<bool> {
    let fake = fake_failure("Failed by intent (fake_next_op, Single unit error in [all success] condition)")
        .on_channel(PLATFORMS_CHANNEL)
        .on_message(report("is_running"));
    // both all and none are there on purpose
    if !expect_verdict(
        env,
        &target_channel(),
        fake.into_message(PLATFORMIX),
        &[Rule::all_success(), Rule::none_fail()],
        true,
        "set fake_next_op",
    )? {
        return Ok(false);
    }
    // another channel
    if !expect_verdict(env, &target_channel(), report("is_running"), &[Rule::none_fail()], true, "report is_running")? {
        return Ok(false);
    }
    // another command
    if !expect_verdict(env, PLATFORMS_CHANNEL, report("running"), &[Rule::all_success()], true, "report running")? {
        return Ok(false);
    }
    expect_verdict(env, PLATFORMS_CHANNEL, report("is_running"), &[Rule::all_success()], false, "faked report")
}

fn single_fail(env: &mut TestEnv) -> anyhow::Result<bool> {
    let fake = fake_failure("Failed by intent (fake_next_op, Single unit error in [single fail] condition)")
        .on_channel(PLATFORMS_CHANNEL)
        .execute(None, None);
    if !expect_verdict(env, &target_channel(), fake.into_message(PLATFORMIX), &[Rule::all_success()], true, "set fake_next_op")? {
        return Ok(false);
    }
    expect_verdict(
        env,
        PLATFORMS_CHANNEL,
        report("running"),
        &[Rule::fail([TARGET]), Rule::others_success()],
        true,
        "[single fail]",
    )
}

fn any_success_fail(env: &mut TestEnv) -> anyhow::Result<bool> {
    let fake = fake_failure("Failed by intent (fake_next_op, All fail on [any success] condition)");
    if !expect_verdict(env, PLATFORMS_CHANNEL, fake.into_message(PLATFORMIX), &[Rule::all_success()], true, "set fake_next_op")? {
        return Ok(false);
    }
    expect_verdict(env, PLATFORMS_CHANNEL, report("running"), &[Rule::any_success()], false, "[any success]")
}

fn not_any_success(env: &mut TestEnv) -> anyhow::Result<bool> {
    expect_verdict(
        env,
        PLATFORMS_CHANNEL,
        report("running"),
        &[Rule::any_success().not()],
        false,
        "[not(any success)]",
    )
}

fn any_fail_success(env: &mut TestEnv) -> anyhow::Result<bool> {
    let fake = fake_failure("Failed by intent (fake_next_op, Should pass as one item failed)").on_channel(PLATFORMS_CHANNEL);
    if !expect_verdict(env, &target_channel(), fake.into_message(PLATFORMIX), &[Rule::all_success()], true, "set fake_next_op")? {
        return Ok(false);
    }
    expect_verdict(env, PLATFORMS_CHANNEL, report("running"), &[Rule::any_fail()], true, "[any fail]")
}

fn no_response(env: &mut TestEnv) -> anyhow::Result<bool> {
    expect_verdict(env, VOID_CHANNEL, report("running"), &[Rule::all_fail()], false, "[no response]")
}

fn set_get(env: &mut TestEnv) -> anyhow::Result<bool> {
    let value = json!({
        "tag": env.generic("tag_default").cloned().unwrap_or(Value::Null),
        "at": env.farm().clock().now().as_secs_f64(),
    });
    let set = Message::call(PLATFORMIX, "set").with_arg("tag").with_arg(value.clone());
    if !env.transaction(&target_channel(), set)?.passed {
        error!("Failed to set property");
        return Ok(false);
    }

    let r = env.transaction(&target_channel(), Message::call(PLATFORMIX, "get").with_arg("tag"))?;
    if !r.passed {
        error!("Failed to get property");
        return Ok(false);
    }
    let got = r.replies.get(TARGET).and_then(|m| m.value("tag"));
    if got != Some(&value) {
        error!("Value of property: {:?} is not that expected: {}!", got, value);
        return Ok(false);
    }

    let wrong = Message::call(PLATFORMIX, "set").with_arg("__shouldnt_exists__").with_arg(value);
    expect_verdict(env, &target_channel(), wrong, &[Rule::all_fail()], true, "set of a wrong property")
}

fn call(env: &mut TestEnv) -> anyhow::Result<bool> {
    let message = Message::call(PLATFORMIX, "call").with_args([json!("call_test"), json!(0), json!(101), json!(202)]);
    let r = env.transaction(&target_channel(), message)?;
    if !r.passed {
        error!("Failed call_test transaction");
        return Ok(false);
    }
    let expected = json!([202, 101, 0]);
    let got = r.replies.get(TARGET).and_then(|m| m.value("value"));
    if got != Some(&expected) {
        error!("Reply of call_test: {:?} is not that expected: {}!", got, expected);
        return Ok(false);
    }

    // raising method
    expect_verdict(
        env,
        &target_channel(),
        Message::call(PLATFORMIX, "call").with_arg("call_test"),
        &[Rule::all_fail()],
        true,
        "call_test without args",
    )
}
