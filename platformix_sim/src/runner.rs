//! Test runner: runs suites inside a test environment.
//!
//! Each test runs between a platform start and a platform stop. A test that
//! raises is recorded as an exception and the platforms are stopped before
//! the next test; if that stop raises too the session is unrecoverable: the
//! Farm is emergency-stopped and the remaining tests are not started.

use crate::error::SimError;
use crate::factory::PlatformFactory;
use crate::scenarios::ScenarioId;
use crate::testenv::TestEnv;
use platformix_core::FarmConfig;
use platformix_env::{BusContext, ManualContext, SystemContext};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub type TestFn = Box<dyn Fn(&mut TestEnv) -> anyhow::Result<bool>>;

/// What a test is supposed to end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Pass,
    /// Checks that a wrong result is caught
    Fail,
    /// Checks that the session survives a raising test
    Exception,
}

pub struct TestCase {
    pub name: String,
    pub expect: Expect,
    f: TestFn,
}

impl TestCase {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut TestEnv) -> anyhow::Result<bool> + 'static,
    {
        Self {
            name: name.into(),
            expect: Expect::Pass,
            f: Box::new(f),
        }
    }

    pub fn expecting(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("expect", &self.expect)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Exception(String),
    NotStarted,
}

impl TestOutcome {
    pub fn meets(&self, expect: Expect) -> bool {
        matches!(
            (self, expect),
            (TestOutcome::Passed, Expect::Pass)
                | (TestOutcome::Failed, Expect::Fail)
                | (TestOutcome::Exception(_), Expect::Exception)
        )
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "passed"),
            TestOutcome::Failed => write!(f, "failed"),
            TestOutcome::Exception(detail) => write!(f, "exception({})", detail),
            TestOutcome::NotStarted => write!(f, "not-started"),
        }
    }
}

/// Result of one test.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub name: String,
    pub outcome: TestOutcome,
    pub expect: Expect,

    /// Bus clock time spent, start and stop included
    pub elapsed_secs: f64,
}

impl TestRecord {
    pub fn as_expected(&self) -> bool {
        self.outcome.meets(self.expect)
    }
}

/// Result of a whole suite.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub records: Vec<TestRecord>,

    /// Stop failure that ended the run early
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
}

impl RunReport {
    /// Tests left unstarted only count against a run through an escalation.
    pub fn passed(&self) -> bool {
        self.escalation.is_none() && self.unexpected().is_empty()
    }

    pub fn unexpected(&self) -> Vec<&TestRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome != TestOutcome::NotStarted && !r.as_expected())
            .collect()
    }
}

/// Runs test lists.
#[derive(Debug, Clone)]
pub struct TestRunner {
    /// Start platforms before and stop them after every test
    start_stop: bool,

    /// Only these tests; all if `None`
    include: Option<Vec<String>>,

    /// Never these tests; wins over `include`
    exclude: Vec<String>,

    /// List what would run without running it
    dry_run: bool,
}

impl TestRunner {
    pub fn new() -> Self {
        Self {
            start_stop: true,
            include: None,
            exclude: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_start_stop(mut self, start_stop: bool) -> Self {
        self.start_stop = start_stop;
        self
    }

    pub fn with_include(mut self, include: Option<Vec<String>>) -> Self {
        self.include = include;
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs the selected `tests` in order.
    ///
    /// # Errors
    /// `UnknownTests` if the include list names a test `tests` lacks.
    pub fn run_tests(&self, env: &mut TestEnv, tests: &[TestCase]) -> Result<RunReport, SimError> {
        if let Some(include) = &self.include {
            let missing: Vec<String> = include
                .iter()
                .filter(|name| !tests.iter().any(|t| &t.name == *name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(SimError::UnknownTests {
                    missing,
                    available: tests.iter().map(|t| t.name.clone()).collect(),
                });
            }
        }

        let selected: Vec<&TestCase> = tests
            .iter()
            .filter(|t| !self.exclude.contains(&t.name))
            .filter(|t| self.include.as_ref().map_or(true, |i| i.contains(&t.name)))
            .collect();
        let mut report = RunReport::default();
        for test in &selected {
            report.records.push(TestRecord {
                name: test.name.clone(),
                outcome: TestOutcome::NotStarted,
                expect: test.expect,
                elapsed_secs: 0.0,
            });
        }
        if self.dry_run {
            for test in &selected {
                info!("Would run {}", test.name);
            }
            return Ok(report);
        }

        for (i, test) in selected.iter().enumerate() {
            info!("Starting test {}...", test.name);
            let began = env.farm().clock().now();
            let outcome = match self.run_test(env, test) {
                Ok(true) => TestOutcome::Passed,
                Ok(false) => TestOutcome::Failed,
                Err(e) => {
                    error!("Exception occurred on test '{}': {:#}", test.name, e);
                    TestOutcome::Exception(format!("{:#}", e))
                }
            };
            let record = &mut report.records[i];
            record.elapsed_secs = secs(env.farm().clock().now().saturating_sub(began));
            let raised = matches!(outcome, TestOutcome::Exception(_));
            record.outcome = outcome;

            if raised && self.start_stop {
                if let Err(e) = env.stop_platforms() {
                    error!(
                        "Unrecoverable exception occurred during test {}! Aborting run: {:#}",
                        test.name, e
                    );
                    report.escalation = Some(format!("stop_platforms: {:#}", e));
                    if !env.emergency_stop() {
                        error!("Emergency stop reported failures");
                    }
                    break;
                }
            }
        }
        let skipped = report.records.iter().filter(|r| r.outcome == TestOutcome::NotStarted).count();
        if skipped > 0 {
            warn!("{} tests were not started", skipped);
        }
        Ok(report)
    }

    fn run_test(&self, env: &mut TestEnv, test: &TestCase) -> anyhow::Result<bool> {
        if self.start_stop {
            env.start_platforms()?;
        }
        let result = (test.f)(env)?;
        if self.start_stop {
            env.stop_platforms()?;
        }
        Ok(result)
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether every test ended as expected
    pub passed: bool,

    pub report: RunReport,

    /// Failure message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Runs built-in scenarios.
pub struct ScenarioRunner {
    /// Session seed
    seed: u64,

    /// Real clock instead of the manual one
    real_time: bool,

    /// Generic overrides from the command line
    generics: Vec<(String, String)>,

    config: FarmConfig,
    tests: TestRunner,
    factory: PlatformFactory,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            real_time: false,
            generics: Vec::new(),
            config: FarmConfig::default(),
            tests: TestRunner::new(),
            factory: PlatformFactory::new(),
        }
    }

    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    pub fn with_generics(mut self, generics: Vec<(String, String)>) -> Self {
        self.generics = generics;
        self
    }

    pub fn with_config(mut self, config: FarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_test_runner(mut self, tests: TestRunner) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_factory(mut self, factory: PlatformFactory) -> Self {
        self.factory = factory;
        self
    }

    fn clock(&self) -> Arc<dyn BusContext> {
        if self.real_time {
            SystemContext::shared()
        } else {
            ManualContext::shared(self.seed)
        }
    }

    /// Runs a scenario.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_env(scenario).0
    }

    /// Runs a scenario and hands back the environment for inspection.
    pub fn run_with_env(&self, scenario: ScenarioId) -> (ScenarioResult, Option<TestEnv>) {
        info!("Running scenario: {} (seed={})", scenario.name(), self.seed);
        let mut result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            report: RunReport::default(),
            failure_reason: None,
        };

        let mut description = match scenario.environment() {
            Ok(description) => description,
            Err(e) => {
                result.failure_reason = Some(format!("description: {}", e));
                return (result, None);
            }
        };
        for (name, text) in &self.generics {
            description.override_generic(name, text);
        }
        let mut env = match TestEnv::from_description(description, &self.factory, self.config.clone(), self.clock()) {
            Ok(env) => env,
            Err(e) => {
                result.failure_reason = Some(format!("environment: {}", e));
                return (result, None);
            }
        };

        match self.tests.run_tests(&mut env, &scenario.tests()) {
            Ok(report) => {
                result.passed = report.passed();
                result.failure_reason = report.escalation.clone().or_else(|| {
                    let unexpected = report.unexpected();
                    (!unexpected.is_empty()).then(|| {
                        unexpected
                            .iter()
                            .map(|r| format!("{}: {}", r.name, r.outcome))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                });
                result.report = report;
            }
            Err(e) => result.failure_reason = Some(e.to_string()),
        }
        (result, Some(env))
    }
}
