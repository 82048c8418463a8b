//! Built-in scenarios: an environment description plus the suite run in it.

use crate::description::EnvDescription;
use crate::error::DescriptionError;
use crate::runner::TestCase;
use crate::suites::{arith, chain, smoke};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Built-in scenario identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Self test of the lifecycle protocol and the evaluator
    PlatformixSmoke,
    /// Calculator answering from its own arithmetic
    ArithMock,
    /// Sequencer driving a calculator attached to a subject link
    ArithSequence,
    /// Start and stop ordering along a dependency chain
    DependencyChain,
}

impl ScenarioId {
    pub fn all() -> &'static [ScenarioId] {
        &[
            ScenarioId::PlatformixSmoke,
            ScenarioId::ArithMock,
            ScenarioId::ArithSequence,
            ScenarioId::DependencyChain,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::PlatformixSmoke => "platformix_smoke",
            ScenarioId::ArithMock => "arith_mock",
            ScenarioId::ArithSequence => "arith_sequence",
            ScenarioId::DependencyChain => "dependency_chain",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::PlatformixSmoke => "Lifecycle, fault injection and expectation rules on three platforms",
            ScenarioId::ArithMock => "Arithmetic of a mocked calculator",
            ScenarioId::ArithSequence => "Seeded request sequence checked by the sequencer and a scoreboard",
            ScenarioId::DependencyChain => "Dependency graph, stop wait timeout and aborted starts",
        }
    }

    /// Environment description of the scenario.
    pub fn environment(&self) -> Result<EnvDescription, DescriptionError> {
        let value = match self {
            ScenarioId::PlatformixSmoke => json!({
                "generics": {"tag_default": "platformix smoke"},
                "platforms": {
                    "platform_a": {"base_platform": "platformix"},
                    "platform_b": {"base_platform": "platformix", "wait": ["platform_a"]},
                    "platform_c": {"base_platform": "platformix", "platform": "platform_b"}
                }
            }),
            ScenarioId::ArithMock => json!({
                "platforms": {
                    "calc": {"base_platform": "calc", "mock": true}
                }
            }),
            ScenarioId::ArithSequence => json!({
                "generics": {"runs": 20},
                "platforms": {
                    "calc": {"base_platform": "calc", "subject": "calculator"},
                    "sequencer": {"base_platform": "sequencer", "platform": "calc", "runs": 10},
                    "scoreboard": {
                        "base_platform": "scoreboard",
                        "cmd": {"channel": "@calc", "interface": "arith"},
                        "rules": "arith_all",
                        "clean_completed": true
                    },
                    "coverage": {
                        "base_platform": "coverage",
                        "channel": "@calc",
                        "interface": "arith",
                        "rules": "arith_all"
                    }
                }
            }),
            ScenarioId::DependencyChain => json!({
                "alias": {"root": "platform_a"},
                "platforms": {
                    "platform_a": {"base_platform": "platformix", "stop_max_wait": 0.5},
                    "platform_b": {"base_platform": "platformix", "wait": ["root"]},
                    "platform_c": {"base_platform": "platformix", "platform": "platform_b"},
                    "platform_d": {"base_platform": "platformix", "condition": false}
                }
            }),
        };
        EnvDescription::from_value(value)
    }

    pub fn tests(&self) -> Vec<TestCase> {
        match self {
            ScenarioId::PlatformixSmoke => smoke::tests(),
            ScenarioId::ArithMock => arith::mock_tests(),
            ScenarioId::ArithSequence => arith::sequence_tests(),
            ScenarioId::DependencyChain => chain::tests(),
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "platformix_smoke" | "smoke" => Ok(ScenarioId::PlatformixSmoke),
            "arith_mock" | "mock" => Ok(ScenarioId::ArithMock),
            "arith_sequence" | "sequence" => Ok(ScenarioId::ArithSequence),
            "dependency_chain" | "chain" => Ok(ScenarioId::DependencyChain),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
