//! Bus message envelope and reply constructors.
//!
//! A message is either a *call* (interface + method + arguments) or a
//! *reply* (method [`REPLY_METHOD`]). Replies carry their verdict in the
//! reserved `__result__` kwarg:
//!
//! ```text
//! success: {"__result__": "success", <name>: <value>}
//! failure: {"__result__": "fail", "state": <text>, "errcode": <int>}
//! notify:  {"state": <text>}                  (no __result__)
//! ```

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Method name reserved for replies.
pub const REPLY_METHOD: &str = "__reply__";

/// Method name reserved for the built-in testing facilities of every protocol.
pub const TESTING_METHOD: &str = "__testing__";

/// Reply kwarg holding the verdict.
pub const RESULT_KEY: &str = "__result__";

/// Return value name used when a success doesn't name its value.
pub const DEFAULT_RETVAL: &str = "value";

/// Error code of an ordinary failure.
pub const ERRCODE_FAILURE: i64 = -1;

/// Error code of a failure caused by an error raised inside a worker hook.
pub const ERRCODE_EXCEPTION: i64 = -2;

const RESULT_SUCCESS: &str = "success";
const RESULT_FAIL: &str = "fail";

/// Keyword arguments of a message.
pub type Kwargs = Map<String, Value>;

/// Kind of a reply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Terminal success
    Success,
    /// Terminal failure
    Failure,
    /// Transitional progress report
    Notify,
}

/// The bus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sending component; `None` for the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Interface id (method vocabulary)
    pub interface: String,

    /// Method name, or [`REPLY_METHOD`] for replies
    pub method: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Message {
    /// Creates a call message without arguments.
    pub fn call(interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            sender: None,
            interface: interface.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    /// Appends one positional argument.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replaces positional arguments.
    pub fn with_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets one keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Sets the sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the interface (used when a reply is bound to a context).
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    fn reply(kwargs: Kwargs) -> Self {
        Self {
            sender: None,
            interface: String::new(),
            method: REPLY_METHOD.to_string(),
            args: Vec::new(),
            kwargs,
        }
    }

    /// Success reply carrying `value` under the default name.
    pub fn success(value: impl Into<Value>) -> Self {
        Self::success_named(value, DEFAULT_RETVAL)
    }

    /// Success reply carrying `value` under `name`.
    pub fn success_named(value: impl Into<Value>, name: &str) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert(RESULT_KEY.into(), RESULT_SUCCESS.into());
        kwargs.insert(name.to_string(), value.into());
        Self::reply(kwargs)
    }

    /// Success reply whose return values are the fields of `fields`.
    pub fn success_fields(fields: Kwargs) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert(RESULT_KEY.into(), RESULT_SUCCESS.into());
        kwargs.extend(fields);
        Self::reply(kwargs)
    }

    /// Failure reply with the ordinary error code.
    pub fn failure(state: impl Into<Value>) -> Self {
        Self::failure_code(state, ERRCODE_FAILURE)
    }

    /// Failure reply with an explicit error code.
    pub fn failure_code(state: impl Into<Value>, errcode: i64) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert(RESULT_KEY.into(), RESULT_FAIL.into());
        kwargs.insert("state".into(), state.into());
        kwargs.insert("errcode".into(), errcode.into());
        Self::reply(kwargs)
    }

    /// Failure reply for an error raised inside a worker hook.
    pub fn failure_exception(state: impl Into<Value>) -> Self {
        Self::failure_code(state, ERRCODE_EXCEPTION)
    }

    /// Progress (notify) reply.
    pub fn notify(state: impl Into<Value>) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert("state".into(), state.into());
        Self::reply(kwargs)
    }

    pub fn is_reply(&self) -> bool {
        self.method == REPLY_METHOD
    }

    /// Kind of the reply, `None` for calls.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        if !self.is_reply() {
            return None;
        }
        match self.kwargs.get(RESULT_KEY).and_then(Value::as_str) {
            Some(RESULT_SUCCESS) => Some(ReplyKind::Success),
            Some(RESULT_FAIL) => Some(ReplyKind::Failure),
            _ => Some(ReplyKind::Notify),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reply_kind() == Some(ReplyKind::Success)
    }

    pub fn is_failure(&self) -> bool {
        self.reply_kind() == Some(ReplyKind::Failure)
    }

    pub fn is_notify(&self) -> bool {
        self.reply_kind() == Some(ReplyKind::Notify)
    }

    /// Reply payload without the reserved verdict key.
    pub fn reply_data(&self) -> Kwargs {
        let mut data = self.kwargs.clone();
        data.remove(RESULT_KEY);
        data
    }

    /// The `state` text of a failure or notify.
    pub fn state(&self) -> Option<&Value> {
        self.kwargs.get("state")
    }

    /// The error code of a failure.
    pub fn errcode(&self) -> Option<i64> {
        if self.is_failure() {
            self.kwargs.get("errcode").and_then(Value::as_i64)
        } else {
            None
        }
    }

    /// Return value stored under `name` in a success.
    pub fn value(&self, name: &str) -> Option<&Value> {
        if self.is_success() {
            self.kwargs.get(name)
        } else {
            None
        }
    }

    /// Checks the message shape.
    ///
    /// Calls need an interface and a method; replies need a recognized
    /// verdict (or none at all for notifies).
    pub fn validate(&self) -> Result<(), BusError> {
        if self.is_reply() {
            match self.kwargs.get(RESULT_KEY) {
                None => Ok(()),
                Some(Value::String(r)) if r == RESULT_SUCCESS => Ok(()),
                Some(Value::String(r)) if r == RESULT_FAIL => {
                    if self.kwargs.contains_key("state") && self.kwargs.contains_key("errcode") {
                        Ok(())
                    } else {
                        Err(BusError::malformed(format!("failure without state/errcode: {}", self)))
                    }
                }
                Some(other) => Err(BusError::malformed(format!("unknown reply result {}", other))),
            }
        } else if self.interface.is_empty() || self.method.is_empty() {
            Err(BusError::malformed(format!("call without interface or method: {}", self)))
        } else {
            Ok(())
        }
    }

    /// Short one-line form used in conversation logs.
    pub fn summary(&self) -> String {
        match self.reply_kind() {
            Some(ReplyKind::Success) => format!("success {}", Value::Object(self.reply_data())),
            Some(ReplyKind::Failure) => format!(
                "fail({}) {}",
                self.errcode().unwrap_or(ERRCODE_FAILURE),
                self.state().cloned().unwrap_or(Value::Null)
            ),
            Some(ReplyKind::Notify) => format!("notify {}", self.state().cloned().unwrap_or(Value::Null)),
            None => format!("{}.{}{}", self.interface, self.method, Value::Array(self.args.clone())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{}", self.summary()),
        }
    }
}

/// Result of a worker operation, converted into a terminal reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        value: Value,
        /// Return value name; `None` merges an object value into the reply
        #[serde(default)]
        name: Option<String>,
    },
    Failure {
        state: Value,
        errcode: i64,
    },
}

impl Outcome {
    pub fn success(value: impl Into<Value>) -> Self {
        Outcome::Success {
            value: value.into(),
            name: Some(DEFAULT_RETVAL.to_string()),
        }
    }

    pub fn success_named(value: impl Into<Value>, name: &str) -> Self {
        Outcome::Success {
            value: value.into(),
            name: Some(name.to_string()),
        }
    }

    /// Success whose fields become the reply's return values.
    pub fn success_fields(fields: Kwargs) -> Self {
        Outcome::Success {
            value: Value::Object(fields),
            name: None,
        }
    }

    pub fn failure(state: impl Into<Value>) -> Self {
        Outcome::Failure {
            state: state.into(),
            errcode: ERRCODE_FAILURE,
        }
    }

    pub fn failure_code(state: impl Into<Value>, errcode: i64) -> Self {
        Outcome::Failure {
            state: state.into(),
            errcode,
        }
    }

    /// Failure for an error raised inside a worker hook.
    pub fn exception(context: &str, err: &anyhow::Error) -> Self {
        Outcome::Failure {
            state: Value::String(format!("{}: {:#}", context, err)),
            errcode: ERRCODE_EXCEPTION,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Builds the reply message.
    pub fn to_message(&self) -> Message {
        match self {
            Outcome::Success { value, name: Some(name) } => Message::success_named(value.clone(), name),
            Outcome::Success { value: Value::Object(fields), name: None } => {
                Message::success_fields(fields.clone())
            }
            Outcome::Success { value, name: None } => Message::success(value.clone()),
            Outcome::Failure { state, errcode } => Message::failure_code(state.clone(), *errcode),
        }
    }
}
