//! Host <-> application wire protocol.
//!
//! Messages are JSON objects tagged by `type`, framed one per line.  The
//! application side sends [`AppMessage`]s; the host answers with
//! [`HostMessage`]s.  Unknown message types are tolerated so newer
//! applications keep working against older hosts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};

/// Status values carried by `status-report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Initiating,
    Ready,
    Error,
}

/// Application -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppMessage {
    StatusReport {
        status: ReportedStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(alias = "ping")]
    Alive,
    Subscribe {
        namespace: String,
        event: String,
    },
    Invoke {
        /// Opaque to the host; echoed back verbatim in the `promise`.
        #[serde(rename = "invocationId")]
        invocation_id: Value,
        namespace: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Test,
}

/// Outcome tag of a `promise` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseAction {
    Resolve,
    Reject,
}

/// Structured error sent back to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    /// Stack-equivalent context; the host reports the error chain.
    #[serde(default)]
    pub stack: String,
}

impl From<&RuntimeError> for WireError {
    fn from(err: &RuntimeError) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.to_string(),
            stack: format!("{err:?}"),
        }
    }
}

/// Host -> application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Capability descriptor, answer to `status-report: initiating`.
    Descriptor { result: Value },
    /// A subscribed host event.
    Event {
        namespace: String,
        event: String,
        params: Value,
    },
    /// Settlement of an `invoke`.
    #[serde(alias = "invoke")]
    Promise {
        action: PromiseAction,
        #[serde(rename = "invocationId")]
        invocation_id: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

impl HostMessage {
    pub fn resolve(invocation_id: Value, result: Value) -> Self {
        Self::Promise {
            action: PromiseAction::Resolve,
            invocation_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn reject(invocation_id: Value, err: &RuntimeError) -> Self {
        Self::Promise {
            action: PromiseAction::Reject,
            invocation_id,
            result: None,
            error: Some(WireError::from(err)),
        }
    }
}

const KNOWN_APP_TYPES: &[&str] = &[
    "status-report",
    "alive",
    "ping",
    "subscribe",
    "invoke",
    "test",
];

/// Decode one line sent by an application.
///
/// Returns `Ok(None)` for a message whose `type` this host does not know;
/// the message is logged and dropped.  A known type with malformed fields is
/// a protocol error.
pub fn decode(line: &str) -> Result<Option<AppMessage>> {
    let value: Value = serde_json::from_str(line).map_err(|e| RuntimeError::Protocol {
        reason: format!("invalid json: {e}"),
    })?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RuntimeError::Protocol {
            reason: "message has no `type`".to_string(),
        })?;

    if !KNOWN_APP_TYPES.contains(&kind.as_str()) {
        tracing::debug!(message_type = %kind, "unknown message type dropped");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RuntimeError::Protocol {
            reason: format!("malformed `{kind}` message: {e}"),
        })
}

/// Encode a host message as one line (without the trailing newline).
pub fn encode(message: &HostMessage) -> Result<String> {
    serde_json::to_string(message).map_err(|e| RuntimeError::Protocol {
        reason: format!("cannot encode message: {e}"),
    })
}
