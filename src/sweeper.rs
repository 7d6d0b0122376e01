//! Idle-stop and eviction sweeps
//!
//! One scheduler task owns both periodic jobs. Each pass snapshots the id
//! list under the registry lock and then works per app with the lock
//! released, so a slow engine call never blocks the registry. Sweep bodies
//! take `now` explicitly, which lets tests drive a virtual clock.

use crate::registry::AppRegistry;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// How often the idle-stop sweep runs
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often the eviction sweep runs
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Running containers idle longer than this are stopped
pub const IDLE_STOP_AFTER: Duration = Duration::from_secs(15 * 60);

/// Stopped containers idle longer than this are removed
pub const EVICT_AFTER: Duration = Duration::from_secs(60 * 60);

/// Run both sweeps until shutdown
pub async fn run(ctx: crate::context::SharedContext, mut shutdown_rx: watch::Receiver<bool>) {
    let mut stop_tick = interval_at(Instant::now() + IDLE_SWEEP_INTERVAL, IDLE_SWEEP_INTERVAL);
    let mut evict_tick = interval_at(
        Instant::now() + EVICTION_SWEEP_INTERVAL,
        EVICTION_SWEEP_INTERVAL,
    );

    info!(
        idle_interval_secs = IDLE_SWEEP_INTERVAL.as_secs(),
        eviction_interval_secs = EVICTION_SWEEP_INTERVAL.as_secs(),
        "Sweeper started"
    );

    loop {
        tokio::select! {
            _ = stop_tick.tick() => {
                stop_idle(&ctx.registry, SystemTime::now()).await;
            }
            _ = evict_tick.tick() => {
                evict_idle(&ctx.registry, SystemTime::now()).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Sweeper shutting down");
                    break;
                }
            }
        }
    }
}

fn idle_longer_than(last: SystemTime, now: SystemTime, limit: Duration) -> bool {
    now.duration_since(last).map(|d| d > limit).unwrap_or(false)
}

/// Stop every running container whose app has been idle for more than
/// [`IDLE_STOP_AFTER`]. Errors are logged and the pass continues.
pub async fn stop_idle(registry: &AppRegistry, now: SystemTime) {
    for id in registry.ids() {
        let Some(app) = registry.get(&id) else {
            continue;
        };
        if !app.runner.is_running() {
            continue;
        }
        if !idle_longer_than(app.last_invocation(), now, IDLE_STOP_AFTER) {
            continue;
        }

        match app.runner.stop().await {
            Ok(()) => info!(app_id = %id, "Stopped idle container"),
            Err(e) => warn!(app_id = %id, error = %e, "Failed to stop idle container"),
        }
    }
}

/// Remove every stopped container whose app has been idle for more than
/// [`EVICT_AFTER`]. A later request recreates it from scratch.
pub async fn evict_idle(registry: &AppRegistry, now: SystemTime) {
    for id in registry.ids() {
        let Some(app) = registry.get(&id) else {
            continue;
        };
        if app.runner.is_running() || !app.runner.has_container() {
            continue;
        }
        if !idle_longer_than(app.last_invocation(), now, EVICT_AFTER) {
            continue;
        }

        match app.runner.remove().await {
            Ok(()) => info!(app_id = %id, "Evicted idle container"),
            Err(e) => warn!(app_id = %id, error = %e, "Failed to evict idle container"),
        }
    }

    debug!("Eviction sweep complete");
}
