//! Boundary with I/O adapters that proxy to out-of-process subjects.

use crate::error::EnvError;
use std::time::Duration;

/// A line-oriented link to a subject under test.
///
/// The bus engine only relies on two things: each call yields either a
/// payload or an error state, and a call never outlives its timeout.
///
/// # Exchange Flow
///
/// ```text
/// Component                 Link                     Subject
///   |                         |                         |
///   |-- exchange(req, t) ---->|-- request line -------->|
///   |                         |<-------- response line -|
///   |<-- Ok(response) --------|                         |
/// ```
pub trait SubjectLink: Send {
    /// Sends one request line and waits for the matching response line.
    ///
    /// # Arguments
    /// * `request` - The request line (without terminator)
    /// * `timeout` - Upper bound for the whole exchange
    ///
    /// # Returns
    /// * `Ok(response)` - The response line
    /// * `Err(EnvError::Timeout)` - The subject didn't answer in time
    /// * `Err(EnvError::LinkClosed)` - The subject went away
    fn exchange(&mut self, request: &str, timeout: Duration) -> Result<String, EnvError>;

    /// Human readable description of the subject (for logs).
    fn describe(&self) -> String;
}

type Responder = Box<dyn FnMut(&str) -> Result<String, EnvError> + Send>;

/// In-process link that answers through a closure.
///
/// Stands in for a real subject in tests and demo scenarios.
pub struct LoopbackLink {
    name: String,
    responder: Responder,
    exchanges: u64,
}

impl LoopbackLink {
    /// Creates a loopback link answering through `responder`.
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&str) -> Result<String, EnvError> + Send + 'static,
    {
        Self {
            name: name.into(),
            responder: Box::new(responder),
            exchanges: 0,
        }
    }

    /// Number of completed exchanges.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }
}

impl SubjectLink for LoopbackLink {
    fn exchange(&mut self, request: &str, _timeout: Duration) -> Result<String, EnvError> {
        let response = (self.responder)(request)?;
        self.exchanges += 1;
        Ok(response)
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.name)
    }
}
