//! Typed JSON-RPC 2.0 messages and the canonical wire encoding.
//!
//! Every frame on an MCP stdio stream is exactly one of three shapes:
//! a [`Request`] (id + method), a [`Response`] (id + result xor error), or a
//! [`Notification`] (method, no id). [`decode`] classifies a frame with one
//! explicit decision function instead of scattered property probing, so a
//! request with numeric id `0` — falsy in looser languages — classifies
//! correctly, and a frame that fits no shape is rejected outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// JSON-RPC version marker carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Error codes ───────────────────────────────────────────────────────────────

/// Standard JSON-RPC 2.0 error codes plus the application range used here.
pub mod error_codes {
    /// Invalid JSON was received by the peer.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// A defense-proxy rule suppressed the request (server range, disjoint
    /// from the standard codes).
    pub const RULE_BLOCKED: i64 = -32010;
}

// ── Core types ────────────────────────────────────────────────────────────────

/// Request identifier: a JSON number or string.
///
/// `0` and negative numbers are ordinary, valid ids; only a genuinely absent
/// (or `null`) id marks a message as a notification. `Eq + Hash` so ids can
/// key the transport's pending table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request id.
    Number(i64),
    /// String request id.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A method call expecting a correlated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id echoed back by the responder.
    pub id: RequestId,
    /// Method name, e.g. `tools/list`.
    pub method: String,
    /// Method parameters, preserved verbatim.
    pub params: Option<Value>,
}

/// A one-way message; no response is ever produced for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name, e.g. `notifications/initialized`.
    pub method: String,
    /// Parameters, preserved verbatim.
    pub params: Option<Value>,
}

/// The reply to a [`Request`]: a result or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Success result or error object.
    pub outcome: std::result::Result<Value, ErrorObject>,
}

/// JSON-RPC error object carried by an error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code (see [`error_codes`]).
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Method call with a correlation id.
    Request(Request),
    /// Reply correlated to an earlier request.
    Response(Response),
    /// Fire-and-forget method call.
    Notification(Notification),
}

impl Message {
    /// Method name for requests and notifications, `None` for responses.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Correlation id for requests and responses, `None` for notifications.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }
}

// ── Constructors ──────────────────────────────────────────────────────────────

impl Request {
    /// Create a request.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl Notification {
    /// Create a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

impl Response {
    /// Create a success response.
    #[must_use]
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Ok(result),
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(id: impl Into<RequestId>, error: ErrorObject) -> Self {
        Self {
            id: id.into(),
            outcome: Err(error),
        }
    }
}

impl ErrorObject {
    /// Create an error object without attached data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a message as its canonical single-line wire text (no trailing
/// newline; framing appends the delimiter).
///
/// `params` and `data` are omitted entirely when absent, matching what MCP
/// servers emit themselves.
#[must_use]
pub fn encode(message: &Message) -> String {
    encode_value(message).to_string()
}

/// The wire-shaped JSON value of a message, before serialization to text.
/// Useful when the caller wants to pretty-print rather than frame.
#[must_use]
pub fn encode_value(message: &Message) -> Value {
    match message {
        Message::Request(r) => {
            let mut obj = serde_json::Map::new();
            obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
            obj.insert("id".into(), id_value(&r.id));
            obj.insert("method".into(), Value::from(r.method.clone()));
            if let Some(params) = &r.params {
                obj.insert("params".into(), params.clone());
            }
            Value::Object(obj)
        }
        Message::Notification(n) => {
            let mut obj = serde_json::Map::new();
            obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
            obj.insert("method".into(), Value::from(n.method.clone()));
            if let Some(params) = &n.params {
                obj.insert("params".into(), params.clone());
            }
            Value::Object(obj)
        }
        Message::Response(r) => {
            let mut obj = serde_json::Map::new();
            obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
            obj.insert("id".into(), id_value(&r.id));
            match &r.outcome {
                Ok(result) => {
                    obj.insert("result".into(), result.clone());
                }
                Err(error) => {
                    obj.insert(
                        "error".into(),
                        serde_json::to_value(error).unwrap_or_else(|_| {
                            serde_json::json!({
                                "code": error_codes::INTERNAL_ERROR,
                                "message": "error object serialization failed",
                            })
                        }),
                    );
                }
            }
            Value::Object(obj)
        }
    }
}

/// Encode a request directly.
#[must_use]
pub fn encode_request(request: &Request) -> String {
    encode(&Message::Request(request.clone()))
}

/// Encode a notification directly.
#[must_use]
pub fn encode_notification(notification: &Notification) -> String {
    encode(&Message::Notification(notification.clone()))
}

/// Encode a response directly.
#[must_use]
pub fn encode_response(response: &Response) -> String {
    encode(&Message::Response(response.clone()))
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.clone()),
    }
}

// ── Decoding / classification ─────────────────────────────────────────────────

/// Decode one frame of wire text into a typed [`Message`].
///
/// Classification is a single ordered decision:
///
/// 1. the frame must parse as a JSON object carrying `"jsonrpc": "2.0"`;
/// 2. id present and `method` present ⇒ [`Request`];
/// 3. id present and `result` or `error` present ⇒ [`Response`];
/// 4. `method` present without id ⇒ [`Notification`];
/// 5. anything else is invalid.
///
/// A `null` id counts as absent. Unknown extra fields are ignored.
///
/// # Errors
///
/// Returns [`AppError::Codec`] for malformed JSON, a missing or foreign
/// version marker, a malformed id, or a frame that fits none of the three
/// shapes. All of these are recoverable: callers log and keep reading.
pub fn decode(text: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| AppError::Codec(format!("invalid json: {err}")))?;

    let Some(obj) = value.as_object() else {
        return Err(AppError::Codec("frame is not a JSON object".to_owned()));
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(AppError::Codec(format!(
                "unsupported jsonrpc version: {other}"
            )));
        }
        None => {
            return Err(AppError::Codec("missing jsonrpc version marker".to_owned()));
        }
    }

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_id(raw)?),
    };
    let method = obj.get("method").and_then(Value::as_str);

    if let Some(id) = id {
        if let Some(method) = method {
            return Ok(Message::Request(Request {
                id,
                method: method.to_owned(),
                params: obj.get("params").cloned(),
            }));
        }
        if let Some(result) = obj.get("result") {
            return Ok(Message::Response(Response {
                id,
                outcome: Ok(result.clone()),
            }));
        }
        if let Some(error) = obj.get("error") {
            let error: ErrorObject = serde_json::from_value(error.clone())
                .map_err(|err| AppError::Codec(format!("malformed error object: {err}")))?;
            return Ok(Message::Response(Response {
                id,
                outcome: Err(error),
            }));
        }
        return Err(AppError::Codec(
            "id present but no method, result, or error".to_owned(),
        ));
    }

    if let Some(method) = method {
        return Ok(Message::Notification(Notification {
            method: method.to_owned(),
            params: obj.get("params").cloned(),
        }));
    }

    Err(AppError::Codec(
        "frame is neither request, response, nor notification".to_owned(),
    ))
}

fn parse_id(raw: &Value) -> Result<RequestId> {
    match raw {
        Value::Number(n) => n.as_i64().map(RequestId::Number).ok_or_else(|| {
            AppError::Codec(format!("non-integer request id: {n}"))
        }),
        Value::String(s) => Ok(RequestId::String(s.clone())),
        other => Err(AppError::Codec(format!(
            "request id must be a number or string, got {other}"
        ))),
    }
}
