//! Error kinds and JSON response bodies

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Uniform body type used by every handler in this crate.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// The failure kinds this service distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No app registered under the requested id
    NotFound,
    /// An app with this id already exists
    Conflict,
    /// A container-engine call failed (create, start, stop, remove, network-connect)
    EngineFailure,
    /// The ingress port pool is exhausted
    ResourceExhaustion,
    /// Readiness was not signalled within the start timeout
    Timeout,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            // Compat: conflicting creates answer 200 with a message body
            ErrorKind::Conflict => StatusCode::OK,
            ErrorKind::EngineFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ResourceExhaustion => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON envelope shared by error and plain-message responses
#[derive(Debug, Serialize)]
struct MessageBody {
    error: bool,
    message: String,
}

impl MessageBody {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":true}"#.to_string())
    }
}

fn json_body(error: bool, message: impl Into<String>, status: StatusCode) -> Response<ResponseBody> {
    let body = MessageBody {
        error,
        message: message.into(),
    }
    .to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// An error response: `{"error":true,"message":...}` with an explicit status
pub fn error_response(message: impl Into<String>, status: StatusCode) -> Response<ResponseBody> {
    json_body(true, message, status)
}

/// A non-error message response: `{"error":false,"message":...}`
pub fn message_response(message: impl Into<String>, status: StatusCode) -> Response<ResponseBody> {
    json_body(false, message, status)
}

/// Error response with the status implied by the kind
pub fn kind_response(kind: ErrorKind, message: impl Into<String>) -> Response<ResponseBody> {
    match kind {
        // Conflicts keep the non-error envelope for compatibility
        ErrorKind::Conflict => message_response(message, kind.status_code()),
        _ => error_response(message, kind.status_code()),
    }
}

/// A JSON response from an already-serialized payload
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// A plain-text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}
