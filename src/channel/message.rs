//! Control channel wire format.
//!
//! Every line is a JSON object carrying an event name and an ordered argument
//! list:
//!
//! ```json
//! {"event":"log","args":["navigating..."]}
//! {"event":"goto","args":["https://example.com",{}],"call_id":4}
//! {"event":"goto","args":[null,"https://example.com"],"reply_to":4}
//! ```
//!
//! A message with `call_id` expects exactly one reply with a matching
//! `reply_to`. Reply arguments follow the `[error, result]` convention: a
//! `null` first argument means success.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// One framed control channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Event or method name.
    pub event: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Correlation id of a request that expects a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    /// Correlation id of the request this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
}

impl Message {
    /// Fire-and-forget event.
    #[must_use]
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: name.into(),
            args,
            call_id: None,
            reply_to: None,
        }
    }

    /// Request expecting a correlated reply.
    #[must_use]
    pub fn request(name: impl Into<String>, args: Vec<Value>, call_id: u64) -> Self {
        Self {
            event: name.into(),
            args,
            call_id: Some(call_id),
            reply_to: None,
        }
    }

    /// Reply to request `call_id`, carrying either the result or the error.
    #[must_use]
    pub fn reply(name: impl Into<String>, call_id: u64, result: Result<Value>) -> Self {
        let args = match result {
            Ok(value) => vec![Value::Null, value],
            Err(err) => vec![Value::String(remote_message(&err)), Value::Null],
        };
        Self {
            event: name.into(),
            args,
            call_id: None,
            reply_to: Some(call_id),
        }
    }

    /// Interpret this message as a reply.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`] when the first argument is not `null`.
    pub fn into_reply_result(self) -> Result<Value> {
        let mut args = self.args.into_iter();
        match args.next() {
            None | Some(Value::Null) => Ok(args.next().unwrap_or(Value::Null)),
            Some(Value::String(message)) => Err(AppError::Remote(message)),
            Some(other) => {
                let message = other
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| other.to_string(), ToOwned::to_owned);
                Err(AppError::Remote(message))
            }
        }
    }

    /// Parse one line. Blank lines yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Channel`] if the line is not a valid message.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(trimmed)?))
    }

    /// Serialise to a single line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Channel`] if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Text carried across the wire for an error. Remote errors are unwrapped so
/// they do not accumulate prefixes as they bounce between peers.
fn remote_message(err: &AppError) -> String {
    match err {
        AppError::Remote(message) => message.clone(),
        other => other.to_string(),
    }
}
