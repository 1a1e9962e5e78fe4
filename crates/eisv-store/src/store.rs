//! Pluggable state store

use crate::{FileStore, MemoryStore, RetryingStore};
use eisv_core::config::StorageBackend;
use eisv_core::{
    AgentId, AgentMetadata, AgentState, ConfigHandle, DialecticId, DialecticSession, Result,
    SessionBinding,
};
use std::sync::Arc;

pub type SharedStore = Arc<dyn StateStore>;

/// Durable storage for agent state, metadata, dialectic sessions and the
/// session-binding snapshot. Backends decide where records live.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, id: AgentId) -> Result<Option<AgentState>>;
    async fn save_state(&self, state: &AgentState) -> Result<()>;

    async fn load_metadata(&self, id: AgentId) -> Result<Option<AgentMetadata>>;
    async fn save_metadata(&self, meta: &AgentMetadata) -> Result<()>;
    async fn list_metadata(&self) -> Result<Vec<AgentMetadata>>;

    /// Commit one governance cycle: both records or neither.
    ///
    /// Metadata is written first; when the state write then fails the
    /// previous metadata is put back and the state fault is returned.
    async fn save_update(&self, state: &AgentState, meta: &AgentMetadata) -> Result<()> {
        let previous = self.load_metadata(meta.agent_id).await?;
        self.save_metadata(meta).await?;
        if let Err(e) = self.save_state(state).await {
            if let Some(previous) = previous {
                if let Err(undo) = self.save_metadata(&previous).await {
                    tracing::error!(
                        "{} metadata left ahead of state: {} (undo failed: {})",
                        meta.agent_id,
                        e,
                        undo
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn load_dialectic(&self, id: DialecticId) -> Result<Option<DialecticSession>>;
    async fn save_dialectic(&self, session: &DialecticSession) -> Result<()>;
    async fn list_dialectic(&self) -> Result<Vec<DialecticSession>>;

    async fn load_bindings(&self) -> Result<Vec<SessionBinding>>;
    async fn save_bindings(&self, bindings: &[SessionBinding]) -> Result<()>;

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Build the configured backend wrapped in the retry layer. The backend and
/// data directory are fixed here; the retry budget tracks reloads.
pub async fn open_store(config: &ConfigHandle) -> Result<SharedStore> {
    let storage = config.current().storage.clone();
    let inner: SharedStore = match storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(FileStore::open(&storage.data_dir).await?),
    };
    tracing::info!("State store: {} (retry x{})", inner.backend(), storage.retry_attempts);
    Ok(Arc::new(RetryingStore::live(inner, config.clone())))
}
