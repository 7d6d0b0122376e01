//! Data-plane entry: `/app/<id>/...`
//!
//! Resolves the app, drives its runner to ready (the cold-start path),
//! rewrites the URL to the upstream path, and streams the exchange through
//! the runner's reverse proxy.

use crate::admin::app_id_from;
use crate::context::SharedContext;
use crate::error::{error_response, kind_response, ErrorKind, ResponseBody};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, warn};

pub async fn handle(ctx: SharedContext, mut req: Request<Incoming>) -> Response<ResponseBody> {
    let Some(id) = app_id_from(req.uri().path(), "/app/").map(str::to_string) else {
        warn!(path = %req.uri().path(), "Invalid app request");
        return kind_response(ErrorKind::NotFound, "Container not found");
    };

    let Some(app) = ctx.registry.get(&id) else {
        warn!(app_id = %id, "App not found");
        return kind_response(ErrorKind::NotFound, "App not found");
    };

    // Cold start: recreate the container if it was stopped or evicted. The
    // engine sequence is detached from this request so a disconnecting
    // client cannot cancel it mid-rollback.
    if !app.runner.is_ready() {
        let runner_app = Arc::clone(&app);
        let outcome = tokio::spawn(async move {
            if let Err(e) = runner_app.runner.create().await {
                let _ = runner_app.runner.cleanup().await;
                return Err(e.to_string());
            }
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                error!(app_id = %id, error = %message, "Cold start failed");
                return kind_response(ErrorKind::EngineFailure, message);
            }
            Err(e) => {
                return error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    if let Err(e) = app
        .runner
        .block_until_ready(ctx.config.start_timeout)
        .await
    {
        error!(app_id = %id, error = %e, "Timed out waiting for readiness");
        return kind_response(ErrorKind::Timeout, e.to_string());
    }

    // Rewrite /app/<id>/x?q to /x?q for the upstream
    let upstream_uri = {
        let prefix = format!("/app/{}", id);
        let full = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("");
        let Some(rest) = full.strip_prefix(&prefix) else {
            error!(app_id = %id, uri = %req.uri(), "Invalid URL");
            return error_response("Invalid URL", StatusCode::INTERNAL_SERVER_ERROR);
        };
        let rest = if rest.is_empty() || rest.starts_with('?') {
            format!("/{}", rest)
        } else {
            rest.to_string()
        };
        match rest.parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                error!(app_id = %id, error = %e, "Invalid URL");
                return error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };
    *req.uri_mut() = upstream_uri;

    ctx.registry
        .update(&id, |app| app.touch(SystemTime::now()));

    match app.runner.invoke(req).await {
        Ok(response) => response,
        Err(e) => {
            error!(app_id = %id, error = %e, "Upstream request failed");
            error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
