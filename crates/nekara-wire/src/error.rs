//! Error types for the wire protocol layer.
//!
//! [`WireError`] is returned synchronously by engine and transport calls.
//! [`RequestError`] only ever reaches a caller through the completion of the
//! request it belongs to.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A request named a function this node does not expose.
    #[error("Unexpected request {request_id} from {sender}: no method '{func}'")]
    UnexpectedRequest {
        request_id: String,
        sender: String,
        func: String,
    },
    /// A response matched no outstanding request.
    #[error("Unexpected response to {response_to}")]
    UnexpectedResponse { response_to: String },
    /// A payload that is neither a request nor a response.
    #[error("Unexpected message ({reason}): {payload}")]
    UnexpectedMessage { reason: String, payload: String },
    #[error("Peer already registered: {0}")]
    DuplicatePeer(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;

/// Why an outstanding request did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Request [{func}] timed out after {after:?}")]
    TimedOut { func: String, after: Duration },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Failed to send request: {0}")]
    SendFailure(String),
    /// The completion was dropped without being settled.
    #[error("Request abandoned before settlement")]
    Abandoned,
}

/// A failure reported by the remote side of a request.
///
/// Kept apart from local errors so callers can tell "the peer said no"
/// from "we never heard back".
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Remote error: {message}")]
pub struct RemoteError {
    /// Exception or error type name, when the peer sent one.
    pub kind: Option<String>,
    pub message: String,
    /// The payload exactly as received.
    pub data: Value,
}

impl RemoteError {
    /// Rebuild a remote error from the `data` of an error response.
    ///
    /// Objects contribute `type` (or `name`) and `message`; a bare string is
    /// the message; any other value is rendered as JSON.
    pub fn from_data(data: Value) -> Self {
        let (kind, message) = match &data {
            Value::Object(fields) => {
                let kind = fields
                    .get("type")
                    .or_else(|| fields.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let message = match fields.get("message").and_then(Value::as_str) {
                    Some(m) => m.to_string(),
                    None => data.to_string(),
                };
                (kind, message)
            }
            Value::String(s) => (None, s.clone()),
            other => (None, other.to_string()),
        };
        Self {
            kind,
            message,
            data,
        }
    }
}
