//! Retry layer for transient storage faults
//!
//! `StorageFailure` and IO faults are retried with exponential backoff.
//! Anything else, or a fault that outlives the attempt budget, surfaces
//! unchanged.

use crate::{SharedStore, StateStore};
use eisv_core::{
    AgentId, AgentMetadata, AgentState, ConfigHandle, DialecticId, DialecticSession, Result,
    SessionBinding,
};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

enum Budget {
    Fixed { attempts: u32, backoff: Duration },
    /// Read from `storage.retry_*` on every call.
    Live(ConfigHandle),
}

pub struct RetryingStore {
    inner: SharedStore,
    budget: Budget,
}

impl RetryingStore {
    pub fn new(inner: SharedStore, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            budget: Budget::Fixed { attempts, backoff },
        }
    }

    /// Retry budget follows config reloads.
    pub fn live(inner: SharedStore, config: ConfigHandle) -> Self {
        Self {
            inner,
            budget: Budget::Live(config),
        }
    }

    fn budget(&self) -> (u32, Duration) {
        let (attempts, backoff) = match &self.budget {
            Budget::Fixed { attempts, backoff } => (*attempts, *backoff),
            Budget::Live(config) => {
                let storage = &config.current().storage;
                (storage.retry_attempts, Duration::from_millis(storage.retry_backoff_ms))
            }
        };
        (attempts.max(1), backoff)
    }

    async fn retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (attempts, backoff) = self.budget();
        let mut delay = backoff;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient_storage() && attempt < attempts => {
                    warn!(
                        "store {} failed (attempt {}/{}): {}; retrying in {:?}",
                        op, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl StateStore for RetryingStore {
    async fn load_state(&self, id: AgentId) -> Result<Option<AgentState>> {
        self.retry("load_state", || self.inner.load_state(id)).await
    }

    async fn save_state(&self, state: &AgentState) -> Result<()> {
        self.retry("save_state", || self.inner.save_state(state)).await
    }

    async fn load_metadata(&self, id: AgentId) -> Result<Option<AgentMetadata>> {
        self.retry("load_metadata", || self.inner.load_metadata(id)).await
    }

    async fn save_metadata(&self, meta: &AgentMetadata) -> Result<()> {
        self.retry("save_metadata", || self.inner.save_metadata(meta)).await
    }

    async fn list_metadata(&self) -> Result<Vec<AgentMetadata>> {
        self.retry("list_metadata", || self.inner.list_metadata()).await
    }

    async fn save_update(&self, state: &AgentState, meta: &AgentMetadata) -> Result<()> {
        self.retry("save_update", || self.inner.save_update(state, meta)).await
    }

    async fn load_dialectic(&self, id: DialecticId) -> Result<Option<DialecticSession>> {
        self.retry("load_dialectic", || self.inner.load_dialectic(id)).await
    }

    async fn save_dialectic(&self, session: &DialecticSession) -> Result<()> {
        self.retry("save_dialectic", || self.inner.save_dialectic(session)).await
    }

    async fn list_dialectic(&self) -> Result<Vec<DialecticSession>> {
        self.retry("list_dialectic", || self.inner.list_dialectic()).await
    }

    async fn load_bindings(&self) -> Result<Vec<SessionBinding>> {
        self.retry("load_bindings", || self.inner.load_bindings()).await
    }

    async fn save_bindings(&self, bindings: &[SessionBinding]) -> Result<()> {
        self.retry("save_bindings", || self.inner.save_bindings(bindings)).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}
