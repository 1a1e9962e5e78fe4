//! Service wiring shared by every transport

use crate::auth::ResolvedAuth;
use eisv_core::{ConfigHandle, EventBus, Result, SharedClock};
use eisv_dialectic::DialecticCoordinator;
use eisv_engine::sweep::spawn_inactivity_sweeper;
use eisv_engine::Governor;
use eisv_identity::IdentityRegistry;
use eisv_lock::LockManager;
use eisv_store::{open_store, SharedStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct AppState {
    pub config: ConfigHandle,
    pub store: SharedStore,
    pub locks: Arc<LockManager>,
    pub registry: Arc<IdentityRegistry>,
    pub governor: Arc<Governor>,
    pub dialectic: Arc<DialecticCoordinator>,
    pub events: EventBus,
    pub clock: SharedClock,
    pub auth: ResolvedAuth,
    pub started_at: Instant,
}

impl AppState {
    /// Open the configured store and wire every component over it.
    pub async fn build(config: ConfigHandle, clock: SharedClock, auth: ResolvedAuth) -> Result<Arc<Self>> {
        let store = open_store(&config).await?;
        Self::with_store(config, store, clock, auth).await
    }

    pub async fn with_store(
        config: ConfigHandle,
        store: SharedStore,
        clock: SharedClock,
        auth: ResolvedAuth,
    ) -> Result<Arc<Self>> {
        let snapshot = config.current();
        let events = EventBus::new(snapshot.server.event_buffer);
        let locks = Arc::new(LockManager::new(config.clone(), clock.clone()));
        let registry = Arc::new(IdentityRegistry::new(
            store.clone(),
            locks.clone(),
            config.clone(),
            clock.clone(),
            events.clone(),
        ));
        registry.init().await?;
        let governor = Arc::new(Governor::new(
            store.clone(),
            locks.clone(),
            registry.clone(),
            config.clone(),
            clock.clone(),
            events.clone(),
        ));
        let dialectic = Arc::new(DialecticCoordinator::new(
            store.clone(),
            governor.clone(),
            locks.clone(),
            config.clone(),
            clock.clone(),
            events.clone(),
        ));
        info!("reasoning delegate: {}", dialectic.delegate_name());

        Ok(Arc::new(Self {
            config,
            store,
            locks,
            registry,
            governor,
            dialectic,
            events,
            clock,
            auth,
            started_at: Instant::now(),
        }))
    }

    /// Lock reaper, binding snapshotter, inactivity sweep and dialectic
    /// timeout sweep. All stop on `cancel`.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let reap_every = Duration::from_secs(self.config.current().lock.reap_interval_secs.max(1));
        vec![
            self.locks.spawn_reaper(reap_every, cancel.clone()),
            self.registry.spawn_snapshotter(cancel.clone()),
            spawn_inactivity_sweeper(self.governor.clone(), cancel.clone()),
            self.dialectic.spawn_sweeper(cancel.clone()),
        ]
    }

    /// Persist what only lives in memory.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.drain().await
    }
}
