//! Platformix Environment Abstraction Layer
//!
//! This crate isolates everything the bus engine needs from "the outside
//! world" so that the same engine runs against the real clock in a test
//! session and against a manually driven clock in deterministic tests.
//!
//! # What is abstracted
//!
//! - Time (`now()`, `system_time()`) used for reply deadlines
//! - Log ordering (`next_order()`) used to number conversation records
//! - The cooperative pause taken by the drain loop while it polls
//! - I/O adapters to out-of-process subjects (`SubjectLink`)
//!
//! # Example
//!
//! ```ignore
//! use platformix_env::{BusContext, Deadline, ManualContext};
//!
//! let ctx = ManualContext::new(42);
//! let deadline = Deadline::after(ctx.now(), Duration::from_secs(10));
//! ctx.advance_time(Duration::from_secs(11));
//! assert!(deadline.expired(ctx.now()));
//! ```

mod context;
mod error;
mod link;
mod manual;
mod system_impl;
mod types;

pub use context::BusContext;
pub use error::EnvError;
pub use link::{LoopbackLink, SubjectLink};
pub use manual::ManualContext;
pub use system_impl::SystemContext;
pub use types::{generated_name, Deadline};
