//! Filesystem store: JSON documents under a data directory
//!
//! Layout:
//!   <data_dir>/agents/<uuid>.state.json
//!   <data_dir>/agents/<uuid>.meta.json
//!   <data_dir>/dialectic/<session-id>.json
//!   <data_dir>/bindings.json
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place.

use crate::StateStore;
use eisv_core::{
    AgentId, AgentMetadata, AgentState, DialecticId, DialecticSession, Error, Result,
    SessionBinding,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(base_dir.join("agents")).await?;
        tokio::fs::create_dir_all(base_dir.join("dialectic")).await?;
        tracing::debug!("file store at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    fn state_path(&self, id: AgentId) -> PathBuf {
        self.base_dir.join("agents").join(format!("{id}.state.json"))
    }

    fn meta_path(&self, id: AgentId) -> PathBuf {
        self.base_dir.join("agents").join(format!("{id}.meta.json"))
    }

    fn dialectic_path(&self, id: DialecticId) -> PathBuf {
        self.base_dir.join("dialectic").join(format!("{id}.json"))
    }

    fn bindings_path(&self) -> PathBuf {
        self.base_dir.join("bindings.json")
    }
}

async fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| Error::storage(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::storage(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::storage(format!("corrupt record {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::storage(format!("read {}: {e}", path.display()))),
    }
}

/// Read every `*.json` document in `dir` whose name ends with `suffix`.
/// Corrupt documents are logged and skipped.
async fn read_all<T: DeserializeOwned>(dir: &Path, suffix: &str) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::storage(format!("list {}: {e}", dir.display())))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if !matches {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(v)) => out.push(v),
            Ok(None) => {}
            Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl StateStore for FileStore {
    async fn load_state(&self, id: AgentId) -> Result<Option<AgentState>> {
        read_json(&self.state_path(id)).await
    }

    async fn save_state(&self, state: &AgentState) -> Result<()> {
        write_atomic(&self.state_path(state.agent_id), state).await
    }

    async fn load_metadata(&self, id: AgentId) -> Result<Option<AgentMetadata>> {
        read_json(&self.meta_path(id)).await
    }

    async fn save_metadata(&self, meta: &AgentMetadata) -> Result<()> {
        write_atomic(&self.meta_path(meta.agent_id), meta).await
    }

    async fn list_metadata(&self) -> Result<Vec<AgentMetadata>> {
        read_all(&self.base_dir.join("agents"), ".meta.json").await
    }

    async fn load_dialectic(&self, id: DialecticId) -> Result<Option<DialecticSession>> {
        read_json(&self.dialectic_path(id)).await
    }

    async fn save_dialectic(&self, session: &DialecticSession) -> Result<()> {
        write_atomic(&self.dialectic_path(session.id), session).await
    }

    async fn list_dialectic(&self) -> Result<Vec<DialecticSession>> {
        read_all(&self.base_dir.join("dialectic"), ".json").await
    }

    async fn load_bindings(&self) -> Result<Vec<SessionBinding>> {
        Ok(read_json(&self.bindings_path()).await?.unwrap_or_default())
    }

    async fn save_bindings(&self, bindings: &[SessionBinding]) -> Result<()> {
        write_atomic(&self.bindings_path(), bindings).await
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
