//! Tests for eisv-store: memory and file backends, retry layer

use eisv_core::config::{DynamicsConfig, VoidConfig};
use eisv_core::*;
use eisv_store::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sample_state(id: AgentId) -> AgentState {
    let mut state = AgentState::initial(id, &DynamicsConfig::default(), &VoidConfig::default());
    state.risk = 0.2;
    state.record_history(1000);
    state
}

fn sample_meta(id: AgentId, display: &str) -> AgentMetadata {
    AgentMetadata::new(id, display, chrono::Utc::now())
}

// ===========================================================================
// MemoryStore
// ===========================================================================

#[tokio::test]
async fn memory_store_round_trips_records() {
    let store = MemoryStore::new();
    let id = AgentId::new();
    assert!(store.load_state(id).await.unwrap().is_none());

    store.save_state(&sample_state(id)).await.unwrap();
    store.save_metadata(&sample_meta(id, "agent_a")).await.unwrap();

    let state = store.load_state(id).await.unwrap().unwrap();
    assert_eq!(state.history.len(), 1);
    let meta = store.load_metadata(id).await.unwrap().unwrap();
    assert_eq!(meta.display_id, "agent_a");
    assert_eq!(store.list_metadata().await.unwrap().len(), 1);
}

#[tokio::test]
async fn memory_store_replaces_bindings_snapshot() {
    let store = MemoryStore::new();
    let binding = SessionBinding {
        session_key: SessionKey::new("s1"),
        agent_id: AgentId::new(),
        client_hint: None,
        bound_at: chrono::Utc::now(),
    };
    store.save_bindings(&[binding.clone()]).await.unwrap();
    store.save_bindings(&[binding.clone(), binding]).await.unwrap();
    assert_eq!(store.load_bindings().await.unwrap().len(), 2);
}

// ===========================================================================
// FileStore
// ===========================================================================

#[tokio::test]
async fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = AgentId::new();
    let session = DialecticSession::new(id, SessionType::Review, "circuit breaker", chrono::Utc::now());
    {
        let store = FileStore::open(dir.path()).await.unwrap();
        store.save_state(&sample_state(id)).await.unwrap();
        store.save_metadata(&sample_meta(id, "agent_b")).await.unwrap();
        store.save_dialectic(&session).await.unwrap();
    }

    let store = FileStore::open(dir.path()).await.unwrap();
    let state = store.load_state(id).await.unwrap().unwrap();
    assert!((state.risk - 0.2).abs() < 1e-12);
    let metas = store.list_metadata().await.unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].display_id, "agent_b");
    let loaded = store.load_dialectic(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.reason, "circuit breaker");
    assert_eq!(store.list_dialectic().await.unwrap().len(), 1);
}

#[tokio::test]
async fn file_store_missing_records_are_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    assert!(store.load_metadata(AgentId::new()).await.unwrap().is_none());
    assert!(store.load_bindings().await.unwrap().is_empty());
}

#[tokio::test]
async fn open_store_builds_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GovernanceConfig::default();
    config.storage.backend = eisv_core::config::StorageBackend::File;
    config.storage.data_dir = dir.path().to_path_buf();
    let store = open_store(&ConfigHandle::new(config)).await.unwrap();
    assert_eq!(store.backend(), "file");
    assert!(dir.path().join("agents").is_dir());
}

// ===========================================================================
// RetryingStore
// ===========================================================================

/// Fails the first `failures` saves with the given error, then delegates.
struct FlakyStore {
    inner: MemoryStore,
    failures: u32,
    calls: AtomicU32,
    transient: bool,
}

impl FlakyStore {
    fn new(failures: u32, transient: bool) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures,
            calls: AtomicU32::new(0),
            transient,
        }
    }
}

#[async_trait::async_trait]
impl StateStore for FlakyStore {
    async fn load_state(&self, id: AgentId) -> Result<Option<AgentState>> {
        self.inner.load_state(id).await
    }
    async fn save_state(&self, state: &AgentState) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(if self.transient {
                Error::storage("disk busy")
            } else {
                Error::InvalidArgument("bad record".into())
            });
        }
        self.inner.save_state(state).await
    }
    async fn load_metadata(&self, id: AgentId) -> Result<Option<AgentMetadata>> {
        self.inner.load_metadata(id).await
    }
    async fn save_metadata(&self, meta: &AgentMetadata) -> Result<()> {
        self.inner.save_metadata(meta).await
    }
    async fn list_metadata(&self) -> Result<Vec<AgentMetadata>> {
        self.inner.list_metadata().await
    }
    async fn load_dialectic(&self, id: DialecticId) -> Result<Option<DialecticSession>> {
        self.inner.load_dialectic(id).await
    }
    async fn save_dialectic(&self, session: &DialecticSession) -> Result<()> {
        self.inner.save_dialectic(session).await
    }
    async fn list_dialectic(&self) -> Result<Vec<DialecticSession>> {
        self.inner.list_dialectic().await
    }
    async fn load_bindings(&self) -> Result<Vec<SessionBinding>> {
        self.inner.load_bindings().await
    }
    async fn save_bindings(&self, bindings: &[SessionBinding]) -> Result<()> {
        self.inner.save_bindings(bindings).await
    }
    fn backend(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let flaky = Arc::new(FlakyStore::new(2, true));
    let store = RetryingStore::new(flaky.clone(), 3, Duration::from_millis(1));
    let id = AgentId::new();
    store.save_state(&sample_state(id)).await.unwrap();
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(store.load_state(id).await.unwrap().is_some());
}

#[tokio::test]
async fn persistent_failure_surfaces_after_budget() {
    let flaky = Arc::new(FlakyStore::new(10, true));
    let store = RetryingStore::new(flaky.clone(), 3, Duration::from_millis(1));
    let err = store.save_state(&sample_state(AgentId::new())).await.unwrap_err();
    assert!(matches!(err, Error::StorageFailure(_)));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn live_budget_follows_reload() {
    let mut config = GovernanceConfig::default();
    config.storage.retry_attempts = 1;
    config.storage.retry_backoff_ms = 1;
    let handle = ConfigHandle::new(config.clone());
    let flaky = Arc::new(FlakyStore::new(2, true));
    let store = RetryingStore::live(flaky.clone(), handle.clone());
    let id = AgentId::new();

    assert!(store.save_state(&sample_state(id)).await.is_err());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

    config.storage.retry_attempts = 3;
    handle.replace(config);
    store.save_state(&sample_state(id)).await.unwrap();
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_state_write_rolls_back_metadata() {
    let flaky = FlakyStore::new(1, true);
    let id = AgentId::new();
    flaky.inner.save_metadata(&sample_meta(id, "agent-1")).await.unwrap();

    let mut meta = sample_meta(id, "agent-1");
    meta.total_updates = 1;
    let err = flaky.save_update(&sample_state(id), &meta).await.unwrap_err();
    assert!(matches!(err, Error::StorageFailure(_)));
    assert!(flaky.load_state(id).await.unwrap().is_none());
    assert_eq!(flaky.load_metadata(id).await.unwrap().unwrap().total_updates, 0);
}

#[tokio::test]
async fn update_is_retried_as_a_unit() {
    let flaky = Arc::new(FlakyStore::new(1, true));
    let store = RetryingStore::new(flaky.clone(), 3, Duration::from_millis(1));
    let id = AgentId::new();
    store.save_metadata(&sample_meta(id, "agent-1")).await.unwrap();

    let mut meta = sample_meta(id, "agent-1");
    meta.total_updates = 1;
    store.save_update(&sample_state(id), &meta).await.unwrap();
    assert!(store.load_state(id).await.unwrap().is_some());
    assert_eq!(store.load_metadata(id).await.unwrap().unwrap().total_updates, 1);
}

#[tokio::test]
async fn non_transient_errors_are_not_retried() {
    let flaky = Arc::new(FlakyStore::new(1, false));
    let store = RetryingStore::new(flaky.clone(), 3, Duration::from_millis(1));
    let err = store.save_state(&sample_state(AgentId::new())).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}
