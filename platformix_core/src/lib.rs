//! Platformix Core - Message Bus and Lifecycle Orchestration Engine
//!
//! Components of a testbench talk over named pub/sub channels in
//! conversations (threads). The engine solves three problems:
//! 1. **Correlation**: every reply travels in the context of the request that
//!    caused it, so concurrent conversations never mix
//! 2. **Ordering**: components start only after their prerequisites run and
//!    stop only after their children and dependents stopped
//! 3. **Arbitration**: a transaction's replies are judged against
//!    declarative expectations instead of ad-hoc asserts
//!
//! ```text
//!   TestEnv ──send──► Channel ──fan-out──► Component ──► Protocol ──► Worker
//!      ▲                                      │
//!      │                                 reply registry
//!      └──── Replies ◄──── Farm drain loop ◄──┘
//!               │
//!               ▼
//!        Expectation Evaluator
//! ```

pub mod channel;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod expectation;
pub mod farm;
pub mod fault;
pub mod interface;
pub mod lifecycle;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod worker;

// Re-export key types for convenience
pub use channel::{Channel, ChannelTable, ReplyRouting, VOID_CHANNEL};
pub use component::{personal_channel, Component, ComponentSpec, PLATFORMS_CHANNEL};
pub use config::FarmConfig;
pub use context::TalkContext;
pub use error::BusError;
pub use expectation::{evaluate, Expected, Rule, Selector, TransactionReport};
pub use farm::{Farm, Processing, Replies, ENVIRONMENT};
pub use fault::{FaultRule, MessageTemplate};
pub use interface::{Call, Completion, Interface, MethodFn, MethodTable, Protocol};
pub use lifecycle::{Action, LifecycleFlags, LifecycleState, PLATFORMIX};
pub use mailbox::Ticket;
pub use message::{Kwargs, Message, Outcome};
pub use worker::{RequestEnd, RequestOptions, Worker, WorkerCx};
