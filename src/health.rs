//! Readiness callback from guest containers
//!
//! A guest announces it is serving by issuing `GET /health/<id>` back to
//! this service, which releases every request waiting on the app's
//! readiness latch.

use crate::admin::app_id_from;
use crate::context::SharedContext;
use crate::error::{error_response, kind_response, text_response, ErrorKind, ResponseBody};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};

pub async fn handle(ctx: SharedContext, req: Request<Incoming>) -> Response<ResponseBody> {
    if req.method() != Method::GET {
        return error_response("Unsupported method", StatusCode::BAD_REQUEST);
    }

    let Some(id) = app_id_from(req.uri().path(), "/health/") else {
        return kind_response(ErrorKind::NotFound, "Resource not found");
    };

    let Some(app) = ctx.registry.get(id) else {
        warn!(app_id = %id, "Health signal for unknown app");
        return kind_response(ErrorKind::NotFound, "App not found");
    };

    app.runner.set_ready();
    debug!(app_id = %id, "Guest announced readiness");

    text_response(StatusCode::OK, "Success\n")
}
