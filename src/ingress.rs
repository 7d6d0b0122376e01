//! Ingress configuration store
//!
//! Apps are reachable either through this service's own `/app/<id>` routes
//! (no ingress) or through an nginx reverse proxy in front of it, with one
//! server block per app on a dedicated port. The two variants share the
//! same write/remove/reload contract.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Number of ports available to the nginx variant. Fixed because the nginx
/// container must be started with the matching published port range.
const POOL_SIZE: usize = 100;

/// First port of the pool; slot i maps to BASE_PORT + i
const BASE_PORT: u16 = 5000;

/// Pluggable ingress store
pub enum Ingress {
    /// Apps are only reachable through the router-local /app/ routes
    None { addr: String },
    /// An external nginx instance proxies each app on its own port
    Nginx(NginxPorts),
}

impl Ingress {
    pub fn none(addr: String) -> Self {
        Ingress::None { addr }
    }

    pub fn nginx(addr: String, dir: PathBuf) -> Self {
        Ingress::Nginx(NginxPorts::new(addr, dir))
    }

    /// Publish the app, returning the URL end users reach it at
    pub fn write(&self, app_id: &str) -> anyhow::Result<String> {
        match self {
            Ingress::None { addr } => Ok(frontend_url(addr, app_id)),
            Ingress::Nginx(nginx) => nginx.write(app_id),
        }
    }

    /// Retract the app's entry; absent entries are not an error
    pub fn remove(&self, app_id: &str) -> anyhow::Result<()> {
        match self {
            Ingress::None { .. } => Ok(()),
            Ingress::Nginx(nginx) => nginx.remove(app_id),
        }
    }

    /// Activate pending configuration changes
    pub async fn reload(&self) -> anyhow::Result<()> {
        match self {
            Ingress::None { .. } => Ok(()),
            Ingress::Nginx(nginx) => nginx.reload().await,
        }
    }
}

/// URL of an app on this service's own listener
fn frontend_url(addr: &str, app_id: &str) -> String {
    format!("http://{}/app/{}", addr, app_id)
}

struct PortEntry {
    port: u16,
    file: PathBuf,
}

/// Pool state and the id->entry map, guarded together
struct NginxState {
    ports: [bool; POOL_SIZE],
    apps: HashMap<String, PortEntry>,
}

/// Per-app nginx server blocks with exclusive port reservation
pub struct NginxPorts {
    addr: String,
    dir: PathBuf,
    reload_cmd: Vec<String>,
    state: Mutex<NginxState>,
}

impl NginxPorts {
    pub fn new(addr: String, dir: PathBuf) -> Self {
        Self {
            addr,
            dir,
            reload_cmd: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            state: Mutex::new(NginxState {
                ports: [false; POOL_SIZE],
                apps: HashMap::new(),
            }),
        }
    }

    /// Replace the reload command (tests substitute a no-op here)
    pub fn with_reload_command(mut self, cmd: Vec<String>) -> Self {
        self.reload_cmd = cmd;
        self
    }

    fn write(&self, app_id: &str) -> anyhow::Result<String> {
        let file = self.dir.join(format!("{}.conf", app_id));
        let port = self.reserve_port(app_id, file.clone())?;

        let conf = render_server_block(port, &frontend_url(&self.addr, app_id));
        if let Err(e) = std::fs::write(&file, conf) {
            self.release(app_id);
            return Err(anyhow::anyhow!(
                "Could not write ingress config {}: {}",
                file.display(),
                e
            ));
        }

        info!(app_id, port, file = %file.display(), "Wrote ingress entry");
        Ok(format!(":{}", port))
    }

    fn remove(&self, app_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.apps.get(app_id) else {
            return Ok(());
        };
        let (port, file) = (entry.port, entry.file.clone());

        if let Err(e) = std::fs::remove_file(&file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(anyhow::anyhow!(
                    "Could not remove ingress config {}: {}",
                    file.display(),
                    e
                ));
            }
        }

        state.ports[(port - BASE_PORT) as usize] = false;
        state.apps.remove(app_id);
        debug!(app_id, "Removed ingress entry");
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        let status = Command::new(&self.reload_cmd[0])
            .args(&self.reload_cmd[1..])
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("Could not run ingress reload: {}", e))?;

        if !status.success() {
            anyhow::bail!("Ingress reload exited with {}", status);
        }
        Ok(())
    }

    /// Reserve a free slot: random start, linear probe, all under the lock
    fn reserve_port(&self, app_id: &str, file: PathBuf) -> anyhow::Result<u16> {
        let mut state = self.state.lock();
        if state.apps.len() == POOL_SIZE {
            anyhow::bail!("Out of ingress space");
        }

        let mut slot = rand::thread_rng().gen_range(0..POOL_SIZE);
        while state.ports[slot] {
            slot = (slot + 1) % POOL_SIZE;
        }

        state.ports[slot] = true;
        let port = BASE_PORT + slot as u16;
        state.apps.insert(app_id.to_string(), PortEntry { port, file });
        Ok(port)
    }

    /// Undo a reservation whose file write failed
    fn release(&self, app_id: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.apps.remove(app_id) {
            let slot = (entry.port - BASE_PORT) as usize;
            state.ports[slot] = false;
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.state.lock().apps.len()
    }
}

fn render_server_block(port: u16, url: &str) -> String {
    format!(
        "server {{\n\tlisten {};\n  \n\tlocation / {{\n\t\tproxy_pass {}/;\n\t}}\n}}",
        port, url
    )
}

/// List the config files currently present in an ingress directory. Used by
/// tests to check convergence; nginx itself globs the directory.
pub fn conf_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
    Ok(files)
}
