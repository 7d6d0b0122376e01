//! Integration tests for paasling
//!
//! These run the real server on an ephemeral port with the container engine
//! mocked at the trait seam and a scripted guest backend standing in for the
//! app container.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use paasling::config::{Config, LogLevel};
use paasling::context::{Context, SharedContext};
use paasling::engine::{ContainerEngine, ContainerSpec};
use paasling::ingress::{conf_files, Ingress, NginxPorts};
use paasling::{server, sweeper};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Engine double: containers are bookkeeping entries and every backend URL
/// points at the scripted guest server.
struct MockEngine {
    backend: String,
    fail_start: AtomicBool,
    creates: AtomicUsize,
    connects: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
}

impl MockEngine {
    fn new(backend: String) -> Arc<Self> {
        Arc::new(Self {
            backend,
            fail_start: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock-{}", spec.name))
    }

    async fn connect_network(&self, _id: &str, _network: &str) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_container(&self, _id: &str) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("Could not start docker container");
        }
        Ok(())
    }

    async fn stop_container(&self, _id: &str, _timeout: Duration) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> anyhow::Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn backend_url(&self, _name: &str) -> String {
        self.backend.clone()
    }
}

/// Guest stand-in: answers every request with `echo:<path>` so tests can
/// check the rewritten upstream path.
async fn spawn_guest() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = format!("echo:{}", req.uri().path());
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    format!("http://{}", addr)
}

struct TestService {
    addr: String,
    ctx: SharedContext,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_service(
    engine: Arc<MockEngine>,
    start_timeout: Duration,
    ingress_dir: Option<&Path>,
    reload_cmd: &str,
) -> TestService {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let config = Config {
        addr: addr.clone(),
        stop_timeout: Duration::from_secs(1),
        start_timeout,
        network: "paasling-test".to_string(),
        nginx: ingress_dir.is_some(),
        nginx_dir: ingress_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| "/tmp".into()),
        log_level: LogLevel::Off,
    };

    let ingress = match ingress_dir {
        Some(dir) => Ingress::Nginx(
            NginxPorts::new(addr.clone(), dir.to_path_buf())
                .with_reload_command(vec![reload_cmd.to_string()]),
        ),
        None => Ingress::none(addr.clone()),
    };

    let ctx = Context::with_ingress(config, engine, ingress);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve(listener, Arc::clone(&ctx), shutdown_rx));

    // Let the accept loop come up
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestService {
        addr,
        ctx,
        _shutdown_tx: shutdown_tx,
    }
}

async fn http_request(addr: &str, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        method, path, addr
    );
    match body {
        Some(body) => request.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )),
        None => request.push_str("\r\n"),
    }
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn http_get(addr: &str, path: &str) -> (u16, String) {
    http_request(addr, "GET", path, None).await
}

fn demo_body() -> String {
    serde_json::json!({
        "image": "busybox",
        "cmd": "sleep 999",
        "dir": "/tmp/demo",
        "env": ["K=V"]
    })
    .to_string()
}

/// Simulate the guest's readiness callback arriving a moment after start
fn signal_ready_after(addr: String, id: &str, delay: Duration) {
    let path = format!("/health/{}", id);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = http_get(&addr, &path).await;
    });
}

#[tokio::test]
async fn test_create_and_invoke_happy_path() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    let (status, body) =
        http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    assert_eq!(status, 200);
    let app: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(app["id"], "demo");
    assert_eq!(app["runner"]["Image"], "busybox");
    assert_eq!(app["runner"]["isRunning"], true);
    assert_eq!(
        app["externalUrl"],
        format!("http://{}/app/demo", service.addr)
    );

    // Guest announces readiness
    let (status, body) = http_get(&service.addr, "/health/demo").await;
    assert_eq!(status, 200);
    assert!(body.contains("Success"));

    // Data plane proxies with the /app/demo prefix stripped
    let (status, body) = http_get(&service.addr, "/app/demo/ping").await;
    assert_eq!(status, 200);
    assert_eq!(body, "echo:/ping");

    assert_eq!(engine.creates.load(Ordering::SeqCst), 1);
    assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_after_post_roundtrip() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    let (status, body) = http_get(&service.addr, "/admin/x").await;

    assert_eq!(status, 200);
    let app: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(app["id"], "x");
}

#[tokio::test]
async fn test_duplicate_post_conflicts_without_engine_call() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    let (status, _) = http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(status, 200);

    let (status, body) = http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(status, 200);
    assert!(body.contains("Container already exists"));

    assert_eq!(engine.creates.load(Ordering::SeqCst), 1);
    assert_eq!(service.ctx.registry.len(), 1);
}

#[tokio::test]
async fn test_concurrent_posts_create_exactly_once() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    let addr_a = service.addr.clone();
    let addr_b = service.addr.clone();
    let body = demo_body();
    let body_b = body.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { http_request(&addr_a, "POST", "/admin/x", Some(&body)).await }),
        tokio::spawn(async move { http_request(&addr_b, "POST", "/admin/x", Some(&body_b)).await }),
    );
    let (status_a, body_a) = a.unwrap();
    let (status_b, body_b) = b.unwrap();

    assert_eq!(status_a, 200);
    assert_eq!(status_b, 200);
    let conflicts = [&body_a, &body_b]
        .iter()
        .filter(|b| b.contains("Container already exists"))
        .count();
    let successes = [&body_a, &body_b]
        .iter()
        .filter(|b| b.contains("\"id\":\"x\""))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(successes, 1);

    assert_eq!(engine.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cold_restart_after_idle_stop() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    http_get(&service.addr, "/health/demo").await;
    let (status, _) = http_get(&service.addr, "/app/demo/ping").await;
    assert_eq!(status, 200);

    // 16 minutes of inactivity later the idle sweep stops the container
    let last = service.ctx.registry.get("demo").unwrap().last_invocation();
    sweeper::stop_idle(&service.ctx.registry, last + Duration::from_secs(16 * 60)).await;

    let app = service.ctx.registry.get("demo").unwrap();
    assert!(!app.runner.is_running());
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);

    // The next request restarts the container and waits for readiness again
    signal_ready_after(service.addr.clone(), "demo", Duration::from_millis(100));
    let (status, body) = http_get(&service.addr, "/app/demo/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "echo:/");

    assert_eq!(engine.starts.load(Ordering::SeqCst), 2);
    // Restart reused the stopped container
    assert_eq!(engine.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_eviction_recreates_from_scratch() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    http_get(&service.addr, "/health/demo").await;
    http_get(&service.addr, "/app/demo/ping").await;

    let last = service.ctx.registry.get("demo").unwrap().last_invocation();
    sweeper::stop_idle(&service.ctx.registry, last + Duration::from_secs(16 * 60)).await;
    sweeper::evict_idle(&service.ctx.registry, last + Duration::from_secs(61 * 60)).await;

    let app = service.ctx.registry.get("demo").unwrap();
    assert!(!app.runner.has_container());
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);

    signal_ready_after(service.addr.clone(), "demo", Duration::from_millis(100));
    let (status, body) = http_get(&service.addr, "/app/demo/ping").await;
    assert_eq!(status, 200);
    assert_eq!(body, "echo:/ping");

    assert_eq!(engine.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_readiness_timeout_fails_request() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(2), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;

    // No /health/demo signal ever arrives
    let started = Instant::now();
    let (status, body) = http_get(&service.addr, "/app/demo/").await;
    let elapsed = started.elapsed();

    assert_eq!(status, 500);
    assert!(body.contains("Could not start the container"));
    assert!(elapsed >= Duration::from_millis(1800), "failed too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "failed too late: {:?}", elapsed);
}

#[tokio::test]
async fn test_failed_start_rolls_back_everything() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    engine.fail_start.store(true, Ordering::SeqCst);
    let service = start_service(
        Arc::clone(&engine),
        Duration::from_secs(5),
        Some(dir.path()),
        "true",
    )
    .await;

    let (status, body) = http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(status, 500);
    assert!(body.contains("Could not start docker container"));

    // Registry converged to absent, no ingress fragment was ever written
    let (status, _) = http_get(&service.addr, "/admin/x").await;
    assert_eq!(status, 404);
    assert!(conf_files(dir.path()).unwrap().is_empty());
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);

    // And the pool is usable again once the engine recovers
    engine.fail_start.store(false, Ordering::SeqCst);
    let (status, _) = http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(status, 200);
    assert_eq!(conf_files(dir.path()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_reload_rolls_back_ingress() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(
        Arc::clone(&engine),
        Duration::from_secs(5),
        Some(dir.path()),
        "false",
    )
    .await;

    let (status, _) = http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(status, 500);

    let (status, _) = http_get(&service.addr, "/admin/x").await;
    assert_eq!(status, 404);
    assert!(conf_files(dir.path()).unwrap().is_empty());
    // The runner that briefly existed was torn down
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_nginx_ingress_assigns_port_url() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), Some(dir.path()), "true").await;

    let (status, body) =
        http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    assert_eq!(status, 200);

    let app: serde_json::Value = serde_json::from_str(&body).unwrap();
    let external = app["externalUrl"].as_str().unwrap();
    assert!(external.starts_with(':'), "expected :<port>, got {}", external);

    let conf = std::fs::read_to_string(dir.path().join("demo.conf")).unwrap();
    assert!(conf.contains(&format!("listen {};", &external[1..])));
    assert!(conf.contains(&format!("proxy_pass http://{}/app/demo/;", service.addr)));
}

#[tokio::test]
async fn test_delete_converges_and_second_delete_404s() {
    let dir = tempfile::tempdir().unwrap();
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(
        Arc::clone(&engine),
        Duration::from_secs(5),
        Some(dir.path()),
        "true",
    )
    .await;

    http_request(&service.addr, "POST", "/admin/x", Some(&demo_body())).await;
    assert_eq!(conf_files(dir.path()).unwrap().len(), 1);

    let (status, _) = http_request(&service.addr, "DELETE", "/admin/x", None).await;
    assert_eq!(status, 200);
    assert!(service.ctx.registry.get("x").is_none());
    assert!(conf_files(dir.path()).unwrap().is_empty());
    let stops = engine.stops.load(Ordering::SeqCst);
    let removes = engine.removes.load(Ordering::SeqCst);

    // Second delete: 404, and no further engine calls
    let (status, _) = http_request(&service.addr, "DELETE", "/admin/x", None).await;
    assert_eq!(status, 404);
    assert_eq!(engine.stops.load(Ordering::SeqCst), stops);
    assert_eq!(engine.removes.load(Ordering::SeqCst), removes);
}

#[tokio::test]
async fn test_delete_concurrent_with_invoke() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    http_get(&service.addr, "/health/demo").await;

    // In-flight invoke completes against the then-live runner
    let addr = service.addr.clone();
    let invoke = tokio::spawn(async move { http_get(&addr, "/app/demo/ping").await });
    let (status, _) = http_request(&service.addr, "DELETE", "/admin/demo", None).await;
    assert_eq!(status, 200);
    invoke.await.unwrap();

    // Later requests see absent
    let (status, _) = http_get(&service.addr, "/app/demo/ping").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_health_endpoint_contract() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;

    let (status, _) = http_get(&service.addr, "/health/unknown").await;
    assert_eq!(status, 404);

    let (status, _) = http_request(&service.addr, "POST", "/health/demo", Some("{}")).await;
    assert_eq!(status, 400);

    let (status, body) = http_get(&service.addr, "/health/demo").await;
    assert_eq!(status, 200);
    assert!(body.contains("Success"));

    let app = service.ctx.registry.get("demo").unwrap();
    assert!(app.runner.is_ready());
}

#[tokio::test]
async fn test_unmatched_routes_404() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), None, "true").await;

    let (status, body) = http_get(&service.addr, "/nope").await;
    assert_eq!(status, 404);
    assert!(body.contains("\"error\":true"));

    let (status, _) = http_get(&service.addr, "/app/unknown/ping").await;
    assert_eq!(status, 404);

    let (status, _) = http_get(&service.addr, "/admin/unknown").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_malformed_create_body() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(Arc::clone(&engine), Duration::from_secs(5), None, "true").await;

    let (status, body) =
        http_request(&service.addr, "POST", "/admin/demo", Some("not json")).await;
    assert_eq!(status, 500);
    assert!(body.contains("Could not parse request body"));
    assert_eq!(engine.creates.load(Ordering::SeqCst), 0);
    assert!(service.ctx.registry.is_empty());
}

#[tokio::test]
async fn test_invoke_touches_last_invocation() {
    let guest = spawn_guest().await;
    let engine = MockEngine::new(guest);
    let service = start_service(engine, Duration::from_secs(5), None, "true").await;

    http_request(&service.addr, "POST", "/admin/demo", Some(&demo_body())).await;
    http_get(&service.addr, "/health/demo").await;

    let before = service.ctx.registry.get("demo").unwrap().last_invocation();
    assert_eq!(before, SystemTime::UNIX_EPOCH);

    http_get(&service.addr, "/app/demo/ping").await;
    let after = service.ctx.registry.get("demo").unwrap().last_invocation();
    assert!(after > before);
}
