//! JSON-RPC 2.0 message shapes and the structural classifier.
//!
//! Inbound frames arrive as raw `serde_json::Value`s. [`classify`] sorts
//! each one into a protocol shape using structural predicates — exact
//! field types, not just presence — trying Request, then Notification,
//! then Response, in that fixed order. Anything matching none of the
//! three is [`Incoming::Unrecognized`] and is dropped by the dispatch
//! loop rather than surfaced as an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outgoing request. Ids are allocated by the client, never by callers.
#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outgoing notification. No id, no response expected.
#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// The error object embedded in a failed response, carried verbatim to
/// the caller of the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound request from the server. The response we write back must
/// echo `id` verbatim — servers may use string ids.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

/// An inbound notification from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub params: Option<Value>,
}

/// An inbound response.
///
/// `result: Some(Value::Null)` and `result: None` are different things:
/// the former is a present `"result": null` and fulfills the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<ResponseError>,
}

/// Classification of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
    Unrecognized,
}

fn has_version_tag(value: &Value) -> bool {
    value.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
}

fn is_request_id(value: &Value) -> bool {
    value.is_number() || value.is_string()
}

fn is_response_id(value: &Value) -> bool {
    value.is_number() || value.is_string() || value.is_null()
}

/// Params must be an array or an object; scalars are never valid.
#[must_use]
pub fn is_valid_params(value: &Value) -> bool {
    value.is_array() || value.is_object()
}

fn params_ok(value: &Value) -> bool {
    match value.get("params") {
        None => true,
        Some(params) => is_valid_params(params),
    }
}

fn is_error_object(value: &Value) -> bool {
    value.get("code").is_some_and(|code| code.as_i64().is_some())
        && value.get("message").is_some_and(Value::is_string)
}

/// Structural check for the Request shape: version tag, number-or-string
/// `id`, string `method`, optional array-or-object `params`.
#[must_use]
pub fn is_request(value: &Value) -> bool {
    has_version_tag(value)
        && value.get("id").is_some_and(is_request_id)
        && value.get("method").is_some_and(Value::is_string)
        && params_ok(value)
}

/// Structural check for the Notification shape. An `id` field is not
/// forbidden here; the classification order keeps id-carrying frames out.
#[must_use]
pub fn is_notification(value: &Value) -> bool {
    has_version_tag(value)
        && value.get("method").is_some_and(Value::is_string)
        && params_ok(value)
}

/// Structural check for the Response shape: version tag, `id` that may
/// also be null, optional `result` of any JSON type, optional well-formed
/// `error` object (integer `code`, string `message`).
#[must_use]
pub fn is_response(value: &Value) -> bool {
    has_version_tag(value)
        && value.get("id").is_some_and(is_response_id)
        && value.get("error").is_none_or(is_error_object)
}

fn method_of(value: &Value) -> Option<String> {
    value.get("method").and_then(Value::as_str).map(String::from)
}

/// Classify an inbound frame, first match wins in the order
/// Request, Notification, Response.
#[must_use]
pub fn classify(value: &Value) -> Incoming {
    if is_request(value) {
        if let (Some(id), Some(method)) = (value.get("id"), method_of(value)) {
            return Incoming::Request(RequestMessage {
                id: id.clone(),
                method,
                params: value.get("params").cloned(),
            });
        }
    } else if is_notification(value) {
        if let Some(method) = method_of(value) {
            return Incoming::Notification(NotificationMessage {
                method,
                params: value.get("params").cloned(),
            });
        }
    } else if is_response(value) {
        if let Some(id) = value.get("id") {
            let error = value
                .get("error")
                .and_then(|e| serde_json::from_value(e.clone()).ok());
            return Incoming::Response(ResponseMessage {
                id: id.clone(),
                result: value.get("result").cloned(),
                error,
            });
        }
    }
    Incoming::Unrecognized
}
