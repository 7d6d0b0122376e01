//! Per-app container lifecycle
//!
//! A [`ContainerRunner`] owns one container on behalf of one app and walks it
//! through Absent -> Created -> Running -> Stopped transitions. Engine
//! sequences are serialized by a transition lock so concurrent requests for
//! the same app cannot interleave create/start/stop calls. Readiness is a
//! re-armable latch: the guest's health callback releases every waiter, and
//! stopping the container arms a fresh wait for the next start.

use crate::engine::{ContainerEngine, ContainerSpec};
use crate::error::ResponseBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Pooled HTTP client shared by every runner for upstream requests
pub type UpstreamClient = Client<HttpConnector, Incoming>;

/// Build the shared upstream client
pub fn upstream_client() -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector)
}

/// Engine-facing runtime state. `running` implies a non-empty `docker_id`.
#[derive(Default)]
struct RunnerState {
    docker_id: String,
    running: bool,
}

/// Controls the container instance backing one app
pub struct ContainerRunner {
    spec: ContainerSpec,
    network: String,
    stop_timeout: Duration,
    engine: Arc<dyn ContainerEngine>,
    client: UpstreamClient,
    /// Stable for the runner's whole lifetime
    backend_url: String,

    state: Mutex<RunnerState>,
    /// Serializes engine transition sequences; never held across invoke
    transition: tokio::sync::Mutex<()>,
    ready: AtomicBool,
    ready_tx: broadcast::Sender<()>,
}

impl ContainerRunner {
    pub fn new(
        spec: ContainerSpec,
        network: String,
        stop_timeout: Duration,
        engine: Arc<dyn ContainerEngine>,
        client: UpstreamClient,
    ) -> Self {
        let backend_url = engine.backend_url(&spec.name);
        let (ready_tx, _) = broadcast::channel(16);

        Self {
            spec,
            network,
            stop_timeout,
            engine,
            client,
            backend_url,
            state: Mutex::new(RunnerState::default()),
            transition: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            ready_tx,
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn has_container(&self) -> bool {
        !self.state.lock().docker_id.is_empty()
    }

    /// Whether the guest has announced readiness since the last start
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Entry point for the health callback. Ready is only observable while
    /// the container is running.
    pub fn set_ready(&self) {
        if self.state.lock().running {
            self.ready.store(true, Ordering::SeqCst);
            let _ = self.ready_tx.send(());
        }
    }

    fn rearm(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Bring the runner to Running. Idempotent: Ready is a no-op success,
    /// Stopped only restarts, Absent creates from scratch. Does not wait for
    /// the guest's readiness signal.
    pub async fn create(&self) -> anyhow::Result<()> {
        let _guard = self.transition.lock().await;

        if self.is_ready() {
            return Ok(());
        }

        let (mut docker_id, running) = {
            let state = self.state.lock();
            (state.docker_id.clone(), state.running)
        };

        if docker_id.is_empty() {
            docker_id = self.engine.create_container(&self.spec).await?;
            // Record the handle before the remaining steps so Cleanup can
            // remove a partially-built container.
            self.state.lock().docker_id = docker_id.clone();

            if let Err(e) = self.engine.connect_network(&docker_id, &self.network).await {
                let _ = self
                    .engine
                    .stop_container(&docker_id, self.stop_timeout)
                    .await;
                return Err(e);
            }
        } else if running {
            return Ok(());
        }

        if let Err(e) = self.engine.start_container(&docker_id).await {
            let _ = self.engine.remove_container(&docker_id).await;
            let mut state = self.state.lock();
            state.docker_id.clear();
            state.running = false;
            return Err(e);
        }

        self.state.lock().running = true;
        debug!(name = %self.spec.name, "Runner started, waiting for guest readiness");
        Ok(())
    }

    /// Stop the container, keeping it around for a later restart
    pub async fn stop(&self) -> anyhow::Result<()> {
        let _guard = self.transition.lock().await;

        let (docker_id, running) = {
            let state = self.state.lock();
            (state.docker_id.clone(), state.running)
        };
        if !running || docker_id.is_empty() {
            return Ok(());
        }

        self.engine
            .stop_container(&docker_id, self.stop_timeout)
            .await?;

        self.state.lock().running = false;
        // The next start must wait for a fresh readiness signal
        self.rearm();
        Ok(())
    }

    /// Remove a stopped container entirely, returning the runner to Absent
    pub async fn remove(&self) -> anyhow::Result<()> {
        let _guard = self.transition.lock().await;

        let (docker_id, running) = {
            let state = self.state.lock();
            (state.docker_id.clone(), state.running)
        };
        if running || docker_id.is_empty() {
            return Ok(());
        }

        self.engine.remove_container(&docker_id).await?;
        self.state.lock().docker_id.clear();
        Ok(())
    }

    /// Terminal teardown: stop if running, then remove. Tolerant of
    /// already-gone containers, so it is safe to call from any state.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let _guard = self.transition.lock().await;

        let (docker_id, running) = {
            let state = self.state.lock();
            (state.docker_id.clone(), state.running)
        };
        if docker_id.is_empty() {
            return Ok(());
        }

        if running {
            self.engine
                .stop_container(&docker_id, self.stop_timeout)
                .await?;
            self.state.lock().running = false;
            self.rearm();
        }

        self.engine.remove_container(&docker_id).await?;
        self.state.lock().docker_id.clear();
        Ok(())
    }

    /// Suspend until the guest announces readiness, or fail after `timeout`
    pub async fn block_until_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let mut ready_rx = self.ready_tx.subscribe();

        let result = tokio::time::timeout(timeout, async {
            loop {
                if self.is_ready() {
                    return;
                }
                match ready_rx.recv().await {
                    Ok(()) => {
                        if self.is_ready() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_ready() {
                            return;
                        }
                    }
                }
            }
        })
        .await;

        match result {
            Ok(()) if self.is_ready() => Ok(()),
            _ => Err(anyhow::anyhow!("Could not start the container")),
        }
    }

    /// Stream a request through to the guest. The request URI must already
    /// be rewritten to the upstream path; body, headers, method, and response
    /// streaming pass through unchanged.
    pub async fn invoke(&self, req: Request<Incoming>) -> anyhow::Result<Response<ResponseBody>> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", self.backend_url, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| anyhow::anyhow!("Could not build upstream request: {}", e))?;

        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| anyhow::anyhow!("Could not reach the app: {}", e))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Snapshot for JSON serialization
    pub fn view(&self) -> RunnerView {
        let state = self.state.lock();
        RunnerView {
            image: self.spec.image.clone(),
            cmd: self.spec.cmd.clone(),
            docker_name: self.spec.name.clone(),
            dir: self.spec.mount_dir.clone(),
            env: self.spec.env.clone(),
            is_running: state.running,
        }
    }
}

/// JSON view of a runner, matching the admin API's historical field names
#[derive(Debug, Serialize)]
pub struct RunnerView {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(rename = "DockerName")]
    pub docker_name: String,
    #[serde(rename = "Dir")]
    pub dir: String,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "isRunning")]
    pub is_running: bool,
}
