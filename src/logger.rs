//! Access logging
//!
//! Each request produces one line under the `access` target: remote address
//! (from `X-Forwarded-For`; the server stamps it with the peer address when
//! missing), method, path, response status, user agent, and elapsed
//! milliseconds. Severity filtering happens in the subscriber configured at
//! startup, and emitting a line can never fail a request.

use hyper::body::Incoming;
use hyper::Request;
use hyper::StatusCode;
use tracing::info;

/// Request fields captured before dispatch consumes the request
pub struct RequestRecord {
    remote: String,
    method: String,
    path: String,
    user_agent: String,
}

pub fn record_of(req: &Request<Incoming>) -> RequestRecord {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };

    RequestRecord {
        remote: header("x-forwarded-for"),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        user_agent: header("user-agent"),
    }
}

pub fn log_access(record: &RequestRecord, status: StatusCode, elapsed_ms: u64) {
    info!(
        target: "access",
        remote = %record.remote,
        method = %record.method,
        path = %record.path,
        status = status.as_u16(),
        user_agent = %record.user_agent,
        elapsed_ms,
        "request"
    );
}
