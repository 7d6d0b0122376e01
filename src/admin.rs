//! Admin routes: create, inspect, and delete apps
//!
//! POST builds the registry entry first, so concurrent creates for one id
//! race on a single atomic insert and the loser never touches the engine.
//! Every later failure unwinds with the compensation sequence
//! cleanup -> ingress remove -> registry delete, each step idempotent.

use crate::app::App;
use crate::context::SharedContext;
use crate::engine::ContainerSpec;
use crate::error::{error_response, json_response, kind_response, text_response, ErrorKind, ResponseBody};
use crate::runner::ContainerRunner;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// App ids are caller-chosen and end up in container names, file names, and
/// URLs, so they are restricted to a safe alphabet.
pub fn valid_app_id(id: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id pattern"));
    pattern.is_match(id)
}

/// Extract the app id that follows `prefix`, rejecting anything outside the
/// id alphabet
pub fn app_id_from<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    let id = rest.split('/').next().unwrap_or("");
    valid_app_id(id).then_some(id)
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    image: String,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    env: Vec<String>,
}

pub async fn handle(ctx: SharedContext, req: Request<Incoming>) -> Response<ResponseBody> {
    match req.method() {
        &Method::GET => get(ctx, req).await,
        &Method::POST => post(ctx, req).await,
        &Method::DELETE => delete(ctx, req).await,
        _ => error_response("HTTP Method not supported", StatusCode::BAD_REQUEST),
    }
}

async fn get(ctx: SharedContext, req: Request<Incoming>) -> Response<ResponseBody> {
    let Some(id) = app_id_from(req.uri().path(), "/admin/") else {
        return kind_response(ErrorKind::NotFound, "Resource not found");
    };

    match ctx.registry.get(id) {
        Some(app) => match serde_json::to_string(&app.view()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(app_id = %id, error = %e, "Could not serialize app");
                error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        None => {
            warn!(app_id = %id, "App not found");
            kind_response(ErrorKind::NotFound, "App not found")
        }
    }
}

async fn post(ctx: SharedContext, req: Request<Incoming>) -> Response<ResponseBody> {
    let Some(id) = app_id_from(req.uri().path(), "/admin/").map(str::to_string) else {
        return kind_response(ErrorKind::NotFound, "Resource not found");
    };

    if ctx.registry.get(&id).is_some() {
        return kind_response(ErrorKind::Conflict, "Container already exists");
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(
                format!("Could not read request body: {}", e),
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    };
    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(app_id = %id, error = %e, "Bad create request");
            return error_response(
                format!("Could not parse request body: {}", e),
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    };

    let spec = ContainerSpec {
        name: id.clone(),
        image: request.image,
        cmd: request.cmd.split_whitespace().map(str::to_string).collect(),
        mount_dir: request.dir,
        env: request.env,
    };
    let runner = ContainerRunner::new(
        spec,
        ctx.config.network.clone(),
        ctx.config.stop_timeout,
        ctx.engine.clone(),
        ctx.client.clone(),
    );

    // Atomic insert; the losing side of a concurrent create lands here too
    let Some(app) = ctx.registry.create(App::new(id.clone(), runner)) else {
        return kind_response(ErrorKind::Conflict, "Container already exists");
    };

    // The engine sequence runs on its own task: a client disconnect must not
    // cancel a half-finished create before its rollback completes.
    let outcome = tokio::spawn(async move {
        if let Err(e) = app.runner.create().await {
            error!(app_id = %id, error = %e, "Create failed, rolling back");
            let _ = app.runner.cleanup().await;
            ctx.registry.delete(&id);
            return kind_response(ErrorKind::EngineFailure, e.to_string());
        }

        let external_url = match publish_ingress(&ctx, &id).await {
            Ok(url) => url,
            Err(e) => {
                error!(app_id = %id, error = %e, "Ingress setup failed, rolling back");
                let _ = ctx.ingress.remove(&id);
                let _ = app.runner.cleanup().await;
                ctx.registry.delete(&id);
                return error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        ctx.registry
            .update(&id, |app| app.set_external_url(external_url));

        info!(app_id = %id, "Created app");

        match serde_json::to_string(&app.view()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        }
    })
    .await;

    match outcome {
        Ok(response) => response,
        Err(e) => error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn delete(ctx: SharedContext, req: Request<Incoming>) -> Response<ResponseBody> {
    let Some(id) = app_id_from(req.uri().path(), "/admin/") else {
        return kind_response(ErrorKind::NotFound, "Resource not found");
    };

    let Some(app) = ctx.registry.get(id) else {
        warn!(app_id = %id, "Container not found");
        return kind_response(ErrorKind::NotFound, "Resource not found");
    };

    // Teardown also runs detached so the registry converges even if the
    // caller goes away mid-delete.
    let id = id.to_string();
    let outcome = tokio::spawn(async move {
        let mut first_error: Option<String> = None;

        if let Err(e) = app.runner.cleanup().await {
            error!(app_id = %id, error = %e, "Runner cleanup failed");
            first_error.get_or_insert(e.to_string());
        }
        if let Err(e) = ctx.ingress.remove(&id) {
            error!(app_id = %id, error = %e, "Ingress remove failed");
            first_error.get_or_insert(e.to_string());
        }
        if let Err(e) = ctx.ingress.reload().await {
            error!(app_id = %id, error = %e, "Ingress reload failed");
            first_error.get_or_insert(e.to_string());
        }

        // Always delete so the public view converges to absent
        ctx.registry.delete(&id);

        match first_error {
            Some(message) => error_response(message, StatusCode::INTERNAL_SERVER_ERROR),
            None => {
                info!(app_id = %id, "Deleted app");
                text_response(StatusCode::OK, "")
            }
        }
    })
    .await;

    match outcome {
        Ok(response) => response,
        Err(e) => error_response(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Write and reload the app's ingress entry, returning the external URL
async fn publish_ingress(ctx: &SharedContext, id: &str) -> anyhow::Result<String> {
    let url = ctx.ingress.write(id)?;
    ctx.ingress.reload().await?;
    Ok(url)
}
