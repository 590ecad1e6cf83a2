//! JSON envelopes exchanged over a chat connection.
//!
//! Every frame is a single JSON object discriminated by `"type"`:
//! `request` (client -> server, correlated by `id`), `response` (server ->
//! client, echoes the request `id`) and `notification` (server -> client,
//! uncorrelated).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected {0} envelope from client")]
    UnexpectedKind(&'static str),

    #[error("binary frames are not supported")]
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success(id: i64, data: Value) -> Self {
        Self {
            id,
            status: Status::Success,
            data: Some(data),
            code: None,
            message: None,
        }
    }

    pub fn error(id: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            data: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub data: Value,
}

/// Decode one inbound text frame. Anything other than a well-formed
/// `request` envelope is an error; callers treat it as fatal.
pub fn decode_request(text: &str) -> Result<Request, CodecError> {
    match serde_json::from_str::<Envelope>(text)? {
        Envelope::Request(request) => Ok(request),
        Envelope::Response(_) => Err(CodecError::UnexpectedKind("response")),
        Envelope::Notification(_) => Err(CodecError::UnexpectedKind("notification")),
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}
