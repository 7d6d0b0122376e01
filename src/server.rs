//! HTTP server: accept loop, routing table, and per-connection serving

use crate::context::SharedContext;
use crate::logger;
use crate::router::Router;
use crate::{admin, health, proxy};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Routing table. Patterns are fixed before serving starts; first match
/// wins, anything else is the 404 handler.
pub fn build_router(ctx: &SharedContext) -> Router {
    let mut router = Router::new();

    let admin_ctx = Arc::clone(ctx);
    router.handle(r"^/admin/", move |req| admin::handle(Arc::clone(&admin_ctx), req));

    let app_ctx = Arc::clone(ctx);
    router.handle(r"^/app/", move |req| proxy::handle(Arc::clone(&app_ctx), req));

    let health_ctx = Arc::clone(ctx);
    router.handle(r"^/health/", move |req| {
        health::handle(Arc::clone(&health_ctx), req)
    });

    router
}

/// Bind the configured address and serve until shutdown
pub async fn run(ctx: SharedContext, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&ctx.config.addr).await?;
    serve(listener, ctx, shutdown_rx).await
}

/// Serve on an already-bound listener (tests bind port 0 and pass it in)
pub async fn serve(
    listener: TcpListener,
    ctx: SharedContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let router = Arc::new(build_router(&ctx));
    info!(addr = %listener.local_addr()?, "Server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, router).await {
                                debug!(peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Server shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut req| {
        let router = Arc::clone(&router);
        async move {
            // Keep whatever an ingress in front of us forwarded; otherwise
            // the peer is the client.
            if !req.headers().contains_key("x-forwarded-for") {
                if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
                    req.headers_mut().insert("x-forwarded-for", value);
                }
            }

            let record = logger::record_of(&req);
            let start = Instant::now();
            let response = router.dispatch(req).await;
            logger::log_access(&record, response.status(), start.elapsed().as_millis() as u64);

            Ok::<_, hyper::Error>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
