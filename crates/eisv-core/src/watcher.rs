//! Hot-reloadable configuration handle
//!
//! Polls the config file's mtime. On change the file is reloaded, env
//! overrides reapplied and the result validated; an invalid file is logged
//! and the previous snapshot stays live.

use crate::config::GovernanceConfig;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared, cheaply cloneable view of the live configuration.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<GovernanceConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot. Callers hold it for the duration of one operation.
    pub fn current(&self) -> Arc<GovernanceConfig> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, config: GovernanceConfig) {
        let next = Arc::new(config);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(GovernanceConfig::default())
    }
}

/// Watches a config file and swaps new snapshots into a [`ConfigHandle`].
pub struct ConfigWatcher {
    path: PathBuf,
    handle: ConfigHandle,
    poll_interval: Duration,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, handle: ConfigHandle, poll_interval: Duration) -> Self {
        // Don't fire on startup for the file already loaded
        let last_modified = modified(&path);
        Self {
            path,
            handle,
            poll_interval,
            last_modified,
        }
    }

    /// Check once; returns true when a new config was installed.
    pub fn poll_once(&mut self) -> bool {
        let current = modified(&self.path);
        if current == self.last_modified {
            return false;
        }
        self.last_modified = current;
        if current.is_none() {
            warn!("Config {} disappeared, keeping current config", self.path.display());
            return false;
        }
        match GovernanceConfig::load_resolved(&self.path) {
            Ok(config) => {
                info!("Reloaded config from {}", self.path.display());
                self.handle.replace(config);
                true
            }
            Err(e) => {
                warn!("Rejected config reload from {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Run the poll loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("ConfigWatcher started for {}", self.path.display());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.poll_once();
                }
            }
        }
        info!("ConfigWatcher stopped");
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
