//! Thread-safe app registry
//!
//! One mutex guards the whole map; it is the only path by which `App`
//! handles reach handler code. The lock is never held across engine calls
//! or network I/O - callers snapshot what they need and release it.

use crate::app::App;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AppRegistry {
    apps: Mutex<HashMap<String, Arc<App>>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self {
            apps: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<App>> {
        self.apps.lock().get(id).cloned()
    }

    /// Insert a new app. Returns `None` if the id is already taken, in which
    /// case no write happens.
    pub fn create(&self, app: App) -> Option<Arc<App>> {
        let mut apps = self.apps.lock();
        if apps.contains_key(&app.id) {
            return None;
        }
        let app = Arc::new(app);
        apps.insert(app.id.clone(), Arc::clone(&app));
        Some(app)
    }

    /// Run `mutator` on the app under the registry lock. Returns false if
    /// the id is absent.
    pub fn update<F>(&self, id: &str, mutator: F) -> bool
    where
        F: FnOnce(&App),
    {
        let apps = self.apps.lock();
        match apps.get(id) {
            Some(app) => {
                mutator(app);
                true
            }
            None => false,
        }
    }

    /// Remove an entry; absent ids are not an error
    pub fn delete(&self, id: &str) {
        self.apps.lock().remove(id);
    }

    /// Snapshot of registered ids, for sweepers to iterate outside the lock
    pub fn ids(&self) -> Vec<String> {
        self.apps.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.lock().is_empty()
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}
