//! Process-wide registry of attached caches.
//!
//! One [`SharedPrefs`] per namespace per process: attaching twice
//! would double every subscription and split the pending-change
//! bookkeeping. The registry hands out the existing instance instead,
//! exactly once per name, over one shared transport. Lifecycle is
//! explicit — construct it at process start, `detach_all` at
//! shutdown — rather than ambient global state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::SharedPrefs;
use crate::store::SyncError;
use crate::transport::Transport;

/// Lock-guarded name → cache map.
pub struct PrefsRegistry {
    app_id: String,
    transport: Arc<dyn Transport>,
    prefs: Mutex<HashMap<String, Arc<SharedPrefs>>>,
}

impl PrefsRegistry {
    pub fn new(app_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            app_id: app_id.into(),
            transport,
            prefs: Mutex::new(HashMap::new()),
        }
    }

    /// The conventional namespace for an application's main
    /// preference file.
    pub fn default_name(&self) -> String {
        format!("{}_preferences", self.app_id)
    }

    /// The cache for a namespace, attaching on first use.
    pub async fn get_or_attach(&self, name: &str) -> Result<Arc<SharedPrefs>, SyncError> {
        let mut prefs = self.prefs.lock().await;
        if let Some(existing) = prefs.get(name) {
            return Ok(existing.clone());
        }
        let attached = SharedPrefs::attach(name, self.transport.clone()).await?;
        prefs.insert(name.to_string(), attached.clone());
        Ok(attached)
    }

    /// The cache for the application's default namespace.
    pub async fn default_prefs(&self) -> Result<Arc<SharedPrefs>, SyncError> {
        self.get_or_attach(&self.default_name()).await
    }

    /// Detach and drop one cache. Returns whether it was attached.
    pub async fn detach(&self, name: &str) -> bool {
        match self.prefs.lock().await.remove(name) {
            Some(prefs) => {
                prefs.detach();
                true
            }
            None => false,
        }
    }

    /// Detach every cache; for process shutdown.
    pub async fn detach_all(&self) {
        let mut prefs = self.prefs.lock().await;
        for (_, cache) in prefs.drain() {
            cache.detach();
        }
    }

    /// Names currently attached.
    pub async fn attached(&self) -> Vec<String> {
        self.prefs.lock().await.keys().cloned().collect()
    }
}
