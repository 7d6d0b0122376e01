//! Pattern-indexed request dispatch
//!
//! Routes are `(regex, handler)` pairs registered at startup; the first
//! pattern to match the request path wins, in registration order. Anything
//! unmatched falls through to the 404 handler.

use crate::error::{error_response, ResponseBody};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type HandlerFuture = Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send>>;

/// A boxed async request handler
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

struct Route {
    pattern: Regex,
    handler: Handler,
}

/// Dispatches requests to the first handler whose pattern matches the path
pub struct Router {
    routes: Vec<Route>,
    not_found: Handler,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            not_found: Arc::new(|_req| {
                Box::pin(async { error_response("Resource not found", StatusCode::NOT_FOUND) })
            }),
        }
    }

    /// Register a handler for a path pattern. Panics on an invalid pattern,
    /// which is acceptable since registration happens once at startup.
    pub fn handle<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
    {
        let pattern = Regex::new(pattern).expect("valid route pattern");
        self.routes.push(Route {
            pattern,
            handler: Arc::new(move |req| Box::pin(handler(req))),
        });
    }

    pub fn not_found<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
    {
        self.not_found = Arc::new(move |req| Box::pin(handler(req)));
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        for route in &self.routes {
            if route.pattern.is_match(req.uri().path()) {
                return (route.handler)(req).await;
            }
        }
        (self.not_found)(req).await
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
