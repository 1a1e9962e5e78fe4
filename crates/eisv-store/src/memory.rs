//! In-memory store, for tests and ephemeral deployments

use crate::StateStore;
use dashmap::DashMap;
use eisv_core::{
    AgentId, AgentMetadata, AgentState, DialecticId, DialecticSession, Result, SessionBinding,
};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    states: DashMap<AgentId, AgentState>,
    metadata: DashMap<AgentId, AgentMetadata>,
    dialectic: DashMap<DialecticId, DialecticSession>,
    bindings: RwLock<Vec<SessionBinding>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self, id: AgentId) -> Result<Option<AgentState>> {
        Ok(self.states.get(&id).map(|s| s.clone()))
    }

    async fn save_state(&self, state: &AgentState) -> Result<()> {
        self.states.insert(state.agent_id, state.clone());
        Ok(())
    }

    async fn load_metadata(&self, id: AgentId) -> Result<Option<AgentMetadata>> {
        Ok(self.metadata.get(&id).map(|m| m.clone()))
    }

    async fn save_metadata(&self, meta: &AgentMetadata) -> Result<()> {
        self.metadata.insert(meta.agent_id, meta.clone());
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<AgentMetadata>> {
        Ok(self.metadata.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_update(&self, state: &AgentState, meta: &AgentMetadata) -> Result<()> {
        self.metadata.insert(meta.agent_id, meta.clone());
        self.states.insert(state.agent_id, state.clone());
        Ok(())
    }

    async fn load_dialectic(&self, id: DialecticId) -> Result<Option<DialecticSession>> {
        Ok(self.dialectic.get(&id).map(|s| s.clone()))
    }

    async fn save_dialectic(&self, session: &DialecticSession) -> Result<()> {
        self.dialectic.insert(session.id, session.clone());
        Ok(())
    }

    async fn list_dialectic(&self) -> Result<Vec<DialecticSession>> {
        Ok(self.dialectic.iter().map(|e| e.value().clone()).collect())
    }

    async fn load_bindings(&self) -> Result<Vec<SessionBinding>> {
        Ok(self
            .bindings
            .read()
            .map(|b| b.clone())
            .unwrap_or_else(|p| p.into_inner().clone()))
    }

    async fn save_bindings(&self, bindings: &[SessionBinding]) -> Result<()> {
        let mut guard = self.bindings.write().unwrap_or_else(|p| p.into_inner());
        *guard = bindings.to_vec();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
