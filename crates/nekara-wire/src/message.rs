//! Wire protocol message types.
//!
//! Nodes exchange two JSON object shapes. A request carries `func`, a
//! response carries `responseTo`, and [`classify`] tells them apart by those
//! fields alone before decoding. Stream transports prefix each payload with
//! a 4-byte big-endian length header.

use crate::error::WireResult;
use nekara_types::ids::IdGenerator;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of every request id.
pub const REQUEST_ID_PREFIX: &str = "req-";
/// Prefix of every response id.
pub const RESPONSE_ID_PREFIX: &str = "res-";

/// A call of a named function on a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation id, unique per sending node.
    pub id: String,
    pub sender: String,
    pub recipient: String,
    /// Name of the remote method.
    pub func: String,
    pub args: Vec<Value>,
}

impl RequestMessage {
    pub fn new(
        id: String,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        func: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            recipient: recipient.into(),
            func: func.into(),
            args,
        }
    }

    /// Build the successful answer to this request, sent from its recipient
    /// back to its sender.
    pub fn create_response(&self, id: String, data: Value) -> ResponseMessage {
        ResponseMessage::new(id, &self.recipient, &self.sender, &self.id, data, false)
    }

    /// Build an error answer to this request.
    pub fn create_error_response(&self, id: String, data: Value) -> ResponseMessage {
        ResponseMessage::new(id, &self.recipient, &self.sender, &self.id, data, true)
    }
}

/// The answer to a [`RequestMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    /// Id of the request being answered.
    #[serde(rename = "responseTo")]
    pub response_to: String,
    pub data: Value,
    /// When set, `data` describes a remote failure rather than a result.
    pub error: bool,
}

impl ResponseMessage {
    pub fn new(
        id: String,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        response_to: impl Into<String>,
        data: Value,
        error: bool,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            recipient: recipient.into(),
            response_to: response_to.into(),
            data,
            error,
        }
    }
}

/// Either wire shape, for encoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
}

impl From<RequestMessage> for Message {
    fn from(msg: RequestMessage) -> Self {
        Message::Request(msg)
    }
}

impl From<ResponseMessage> for Message {
    fn from(msg: ResponseMessage) -> Self {
        Message::Response(msg)
    }
}

/// Result of classifying an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// Not JSON, not an object, ambiguous, or missing required fields.
    Malformed { reason: String, payload: String },
}

impl Inbound {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Request(_) => "request",
            Inbound::Response(_) => "response",
            Inbound::Malformed { .. } => "malformed",
        }
    }
}

/// Generate a fresh request id (`req-` + token).
pub fn request_id(ids: &dyn IdGenerator, token_len: usize) -> String {
    format!("{REQUEST_ID_PREFIX}{}", ids.token(token_len))
}

/// Generate a fresh response id (`res-` + token).
pub fn response_id(ids: &dyn IdGenerator, token_len: usize) -> String {
    format!("{RESPONSE_ID_PREFIX}{}", ids.token(token_len))
}

/// Serialize a message to its JSON payload.
pub fn encode(msg: &Message) -> WireResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Classify and decode an inbound payload.
///
/// The payload is parsed once. An object with `func` is a request, one with
/// `responseTo` is a response; an object with both or neither, or one whose
/// fields do not decode into the selected shape, is malformed.
pub fn classify(payload: &str) -> Inbound {
    let malformed = |reason: String| Inbound::Malformed {
        reason,
        payload: payload.to_string(),
    };

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return malformed(format!("invalid JSON: {e}")),
    };

    let (has_func, has_response_to) = match &value {
        Value::Object(fields) => (fields.contains_key("func"), fields.contains_key("responseTo")),
        _ => return malformed("not a JSON object".to_string()),
    };

    match (has_func, has_response_to) {
        (true, false) => match serde_json::from_value::<RequestMessage>(value) {
            Ok(msg) => Inbound::Request(msg),
            Err(e) => malformed(format!("invalid request: {e}")),
        },
        (false, true) => match serde_json::from_value::<ResponseMessage>(value) {
            Ok(msg) => Inbound::Response(msg),
            Err(e) => malformed(format!("invalid response: {e}")),
        },
        (true, true) => malformed("carries both func and responseTo".to_string()),
        (false, false) => malformed("neither a request nor a response".to_string()),
    }
}

/// Frame a payload for a stream transport (4-byte big-endian length + body).
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let body = payload.as_bytes();
    let len = body.len() as u32;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}
