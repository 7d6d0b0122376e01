//! The user-visible unit of compute

use crate::runner::{ContainerRunner, RunnerView};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::time::SystemTime;

/// A registered app. The id is unique for the app's entire lifetime and the
/// runner is owned exclusively by this record; mutable fields sit behind
/// their own locks so handlers can share `Arc<App>` freely.
pub struct App {
    pub id: String,
    last_invocation: Mutex<SystemTime>,
    external_url: RwLock<String>,
    pub runner: ContainerRunner,
}

impl App {
    pub fn new(id: String, runner: ContainerRunner) -> Self {
        Self {
            id,
            last_invocation: Mutex::new(SystemTime::UNIX_EPOCH),
            external_url: RwLock::new(String::new()),
            runner,
        }
    }

    pub fn last_invocation(&self) -> SystemTime {
        *self.last_invocation.lock()
    }

    /// Record an invocation. Callers go through `AppRegistry::update` so the
    /// write happens under the registry lock.
    pub fn touch(&self, now: SystemTime) {
        *self.last_invocation.lock() = now;
    }

    pub fn external_url(&self) -> String {
        self.external_url.read().clone()
    }

    pub fn set_external_url(&self, url: String) {
        *self.external_url.write() = url;
    }

    /// Snapshot for JSON serialization
    pub fn view(&self) -> AppView {
        AppView {
            id: self.id.clone(),
            last_invocation: DateTime::<Utc>::from(self.last_invocation()).to_rfc3339(),
            external_url: self.external_url(),
            runner: self.runner.view(),
        }
    }
}

/// JSON view of an app as returned by the admin API
#[derive(Debug, Serialize)]
pub struct AppView {
    pub id: String,
    #[serde(rename = "lastInvocation")]
    pub last_invocation: String,
    #[serde(rename = "externalUrl")]
    pub external_url: String,
    pub runner: RunnerView,
}
