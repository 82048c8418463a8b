//! Platformix test harness
//!
//! Builds a Farm from an environment description, runs test suites against
//! it and judges every transaction with expectation rules.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        ScenarioRunner                         │
//! │   EnvDescription ──► PlatformFactory ──► TestEnv (Farm)       │
//! │                                              │                │
//! │  ┌───────────────┐    transaction     ┌──────▼──────┐         │
//! │  │  TestRunner   │───────────────────►│  #platforms │         │
//! │  │ start/test/   │◄───────────────────│  @<name>    │         │
//! │  │ stop per case │  TransactionReport │  #sequencer │         │
//! │  └───────────────┘                    └──────┬──────┘         │
//! │                                              │                │
//! │                          ┌──────────┬────────┴─┬──────────┐   │
//! │                          │platformix│   calc   │sequencer │   │
//! │                          └──────────┴────┬─────┴──────────┘   │
//! │                                          │ SubjectLink        │
//! │                                     ┌────▼─────┐              │
//! │                                     │calculator│              │
//! │                                     └──────────┘              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use platformix_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::PlatformixSmoke);
//! assert!(result.passed);
//! ```

pub mod arith;
pub mod description;
pub mod error;
pub mod exporter;
pub mod factory;
pub mod platforms;
pub mod rules;
pub mod runner;
pub mod scenarios;
pub mod suites;
pub mod testenv;

pub use description::{EnvDescription, PlatformEntry};
pub use error::{DescriptionError, FactoryError, SimError};
pub use exporter::SequenceDiagram;
pub use factory::{Blueprint, Parts, PlatformFactory};
pub use rules::{CoverageRules, Prediction, RulesRegistry, ScoreboardRules};
pub use runner::{Expect, RunReport, ScenarioResult, ScenarioRunner, TestCase, TestOutcome, TestRecord, TestRunner};
pub use scenarios::ScenarioId;
pub use testenv::TestEnv;
