//! Session → agent resolution
//!
//! Bindings live in a DashMap keyed by session key and are snapshotted to the
//! store periodically and on drain. Name and display-id indexes are rebuilt
//! from stored metadata on `init`.

use crate::federated::FederatedKeys;
use crate::naming;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eisv_core::config::GovernanceConfig;
use eisv_core::{
    ActiveBinding, AgentId, AgentMetadata, ConfigHandle, Error, EventBus, FederatedSubject,
    LifecycleEventKind, LifecycleStatus, Result, SessionBinding, SessionKey, SharedClock,
};
use eisv_lock::LockManager;
use eisv_store::SharedStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ResolveRequest<'a> {
    pub session: &'a SessionKey,
    /// UUID, display id or display name chosen by the caller.
    pub supplied: Option<&'a str>,
    /// Logical client identity, used to rebind after a reconnect.
    pub client_hint: Option<&'a str>,
}

impl<'a> ResolveRequest<'a> {
    pub fn session(session: &'a SessionKey) -> Self {
        Self {
            session,
            supplied: None,
            client_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolved {
    #[serde(skip)]
    pub agent_id: AgentId,
    pub display_id: String,
    pub display_name: Option<String>,
    pub created: bool,
    pub rebound: bool,
}

impl Resolved {
    fn from_meta(meta: &AgentMetadata, created: bool, rebound: bool) -> Self {
        Self {
            agent_id: meta.agent_id,
            display_id: meta.display_id.clone(),
            display_name: meta.display_name.clone(),
            created,
            rebound,
        }
    }
}

struct NewAgent {
    id: AgentId,
    name: Option<String>,
    parent: Option<AgentId>,
    spawn_reason: Option<String>,
    federated: Option<FederatedSubject>,
}

impl NewAgent {
    fn plain(name: Option<String>) -> Self {
        Self {
            id: AgentId::new(),
            name,
            parent: None,
            spawn_reason: None,
            federated: None,
        }
    }
}

pub struct IdentityRegistry {
    bindings: DashMap<SessionKey, SessionBinding>,
    /// Lowercased display name → agent.
    names: DashMap<String, AgentId>,
    display_ids: DashMap<String, AgentId>,
    /// Serializes resolution per session key so a burst of first contacts
    /// creates one agent.
    session_gates: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    snapshot_gate: tokio::sync::Mutex<()>,
    store: SharedStore,
    locks: Arc<LockManager>,
    config: ConfigHandle,
    clock: SharedClock,
    events: EventBus,
}

impl IdentityRegistry {
    pub fn new(
        store: SharedStore,
        locks: Arc<LockManager>,
        config: ConfigHandle,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            bindings: DashMap::new(),
            names: DashMap::new(),
            display_ids: DashMap::new(),
            session_gates: DashMap::new(),
            snapshot_gate: tokio::sync::Mutex::new(()),
            store,
            locks,
            config,
            clock,
            events,
        }
    }

    // ------------------------------------------------------------------
    // Startup / shutdown
    // ------------------------------------------------------------------

    /// Rebuild indexes from the store and restore the binding snapshot.
    pub async fn init(&self) -> Result<()> {
        let metas = self.store.list_metadata().await?;
        for meta in &metas {
            self.display_ids.insert(meta.display_id.clone(), meta.agent_id);
            if meta.status == LifecycleStatus::Deleted {
                continue;
            }
            if let Some(name) = &meta.display_name {
                self.names.insert(naming::name_key(name), meta.agent_id);
            }
        }
        let live = |id: AgentId| {
            metas
                .iter()
                .any(|m| m.agent_id == id && m.status != LifecycleStatus::Deleted)
        };
        let mut restored = 0;
        for binding in self.store.load_bindings().await? {
            if live(binding.agent_id) {
                self.bindings.insert(binding.session_key.clone(), binding);
                restored += 1;
            }
        }
        info!(
            "Identity registry ready: {} agents, {} bindings restored",
            metas.len(),
            restored
        );
        Ok(())
    }

    /// Persist the binding snapshot. Called on shutdown.
    pub async fn drain(&self) -> Result<()> {
        let n = self.snapshot().await?;
        info!("Identity registry drained ({} bindings saved)", n);
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<usize> {
        let _gate = self.snapshot_gate.lock().await;
        let bindings: Vec<SessionBinding> = self.bindings.iter().map(|b| b.value().clone()).collect();
        self.store.save_bindings(&bindings).await?;
        self.session_gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        debug!("binding snapshot: {} entries", bindings.len());
        Ok(bindings.len())
    }

    pub fn spawn_snapshotter(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let secs = registry.config.current().identity.snapshot_interval_secs.max(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        if let Err(e) = registry.snapshot().await {
                            warn!("binding snapshot failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Resolve a session to an agent, creating one on first contact.
    pub async fn resolve(&self, req: ResolveRequest<'_>) -> Result<Resolved> {
        let gate = self
            .session_gates
            .entry(req.session.clone())
            .or_default()
            .value()
            .clone();
        let _gate = gate.lock().await;

        let config = self.config.current();
        let now = self.clock.now();

        if let Some(supplied) = req.supplied.map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(id) = AgentId::parse(supplied) {
                let meta = self.metadata(id).await?;
                let meta = self.bind(req.session, meta, req.client_hint, now).await?;
                return Ok(Resolved::from_meta(&meta, false, false));
            }
            if let Some(meta) = self.find_by_name(supplied).await? {
                let meta = self.bind(req.session, meta, req.client_hint, now).await?;
                return Ok(Resolved::from_meta(&meta, false, false));
            }
            let name = naming::validate_name(supplied, config.identity.name_max_len)?;
            let meta = self.create(NewAgent::plain(Some(name)), now, &config).await?;
            let meta = self.bind(req.session, meta, req.client_hint, now).await?;
            return Ok(Resolved::from_meta(&meta, true, false));
        }

        let existing = self.bindings.get(req.session).map(|b| b.agent_id);
        if let Some(id) = existing {
            match self.store.load_metadata(id).await? {
                Some(meta) if meta.status != LifecycleStatus::Deleted => {
                    return Ok(Resolved::from_meta(&meta, false, false));
                }
                _ => {
                    debug!("dropping binding of {} to missing agent", req.session);
                    self.bindings.remove(req.session);
                }
            }
        }

        if let Some(hint) = req.client_hint.filter(|h| !h.is_empty()) {
            if let Some(meta) = self.rebind_candidate(hint, now, &config).await? {
                info!("Rebinding session {} to {} via client hint", req.session, meta.public_name());
                let meta = self.bind(req.session, meta, Some(hint), now).await?;
                return Ok(Resolved::from_meta(&meta, false, true));
            }
        }

        if config.identity.auto_bind_single_recent {
            let window = ChronoDuration::seconds(config.identity.single_recent_window_secs as i64);
            let mut recent: Vec<AgentMetadata> = self
                .store
                .list_metadata()
                .await?
                .into_iter()
                .filter(|m| m.status == LifecycleStatus::Active && now - m.last_active_at() <= window)
                .collect();
            if recent.len() == 1 {
                if let Some(meta) = recent.pop() {
                    info!("Auto-binding session {} to sole recent agent {}", req.session, meta.public_name());
                    let meta = self.bind(req.session, meta, req.client_hint, now).await?;
                    return Ok(Resolved::from_meta(&meta, false, true));
                }
            }
        }

        let meta = self.create(NewAgent::plain(None), now, &config).await?;
        let meta = self.bind(req.session, meta, req.client_hint, now).await?;
        Ok(Resolved::from_meta(&meta, true, false))
    }

    /// Resolve through a federated `(issuer, subject)` pair.
    pub async fn resolve_federated(
        &self,
        session: &SessionKey,
        issuer: &str,
        subject: &str,
        client_hint: Option<&str>,
    ) -> Result<Resolved> {
        let config = self.config.current();
        let secret = config
            .identity
            .federated_secret
            .as_deref()
            .ok_or_else(|| Error::InvalidState("federated identity is not enabled".into()))?;
        if issuer.trim().is_empty() || subject.trim().is_empty() {
            return Err(Error::InvalidArgument("issuer and subject are required".into()));
        }
        let keys = FederatedKeys::new(secret);
        let id = FederatedKeys::agent_id(issuer, subject);
        let now = self.clock.now();

        match self.store.load_metadata(id).await? {
            Some(meta) if meta.status == LifecycleStatus::Deleted => {
                Err(Error::NotFound(format!("agent {}", meta.display_id)))
            }
            Some(meta) => {
                let current = meta
                    .federated
                    .as_ref()
                    .is_some_and(|f| keys.verify(issuer, subject, &f.credential));
                let meta = if current {
                    meta
                } else {
                    let credential = keys.credential(issuer, subject);
                    let (_, meta) = self
                        .with_metadata(id, |m| {
                            m.federated = Some(FederatedSubject {
                                issuer: issuer.to_string(),
                                subject: subject.to_string(),
                                credential,
                            });
                            Ok(())
                        })
                        .await?;
                    info!("Rotated federated credential for {}", meta.public_name());
                    meta
                };
                let meta = self.bind(session, meta, client_hint, now).await?;
                Ok(Resolved::from_meta(&meta, false, false))
            }
            None => {
                let new = NewAgent {
                    id,
                    name: None,
                    parent: None,
                    spawn_reason: None,
                    federated: Some(FederatedSubject {
                        issuer: issuer.to_string(),
                        subject: subject.to_string(),
                        credential: keys.credential(issuer, subject),
                    }),
                };
                let meta = self.create(new, now, &config).await?;
                let meta = self.bind(session, meta, client_hint, now).await?;
                Ok(Resolved::from_meta(&meta, true, false))
            }
        }
    }

    /// The agent bound to `session`, without creating one.
    pub fn bound_agent(&self, session: &SessionKey) -> Option<AgentId> {
        self.bindings.get(session).map(|b| b.agent_id)
    }

    /// Bound agent for `session`, as stored. `None` when unbound.
    pub async fn whoami(&self, session: &SessionKey) -> Result<Option<AgentMetadata>> {
        match self.bound_agent(session) {
            Some(id) => match self.metadata(id).await {
                Ok(meta) => Ok(Some(meta)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    async fn rebind_candidate(
        &self,
        hint: &str,
        now: DateTime<Utc>,
        config: &GovernanceConfig,
    ) -> Result<Option<AgentMetadata>> {
        let cutoff = now - ChronoDuration::seconds(config.identity.rebind_lookback_secs as i64);

        let from_bindings = self
            .bindings
            .iter()
            .filter(|b| b.client_hint.as_deref() == Some(hint) && b.bound_at >= cutoff)
            .max_by_key(|b| b.bound_at)
            .map(|b| b.agent_id);
        if let Some(id) = from_bindings {
            if let Some(meta) = self.store.load_metadata(id).await? {
                if meta.status != LifecycleStatus::Deleted {
                    return Ok(Some(meta));
                }
            }
        }

        Ok(self
            .store
            .list_metadata()
            .await?
            .into_iter()
            .filter(|m| {
                m.status != LifecycleStatus::Deleted
                    && m.client_hint.as_deref() == Some(hint)
                    && m.last_active_at() >= cutoff
            })
            .max_by_key(|m| m.last_active_at()))
    }

    /// Bind `session` to `meta`, migrating older sessions of the same client.
    async fn bind(
        &self,
        session: &SessionKey,
        meta: AgentMetadata,
        client_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AgentMetadata> {
        let client_hint = client_hint.filter(|h| !h.is_empty()).map(str::to_string);
        if let Some(hint) = &client_hint {
            self.bindings.retain(|key, b| {
                !(key != session && b.agent_id == meta.agent_id && b.client_hint.as_ref() == Some(hint))
            });
        }
        self.bindings.insert(
            session.clone(),
            SessionBinding {
                session_key: session.clone(),
                agent_id: meta.agent_id,
                client_hint: client_hint.clone(),
                bound_at: now,
            },
        );

        let unchanged = meta.binding.as_ref().is_some_and(|b| &b.session_key == session)
            && (client_hint.is_none() || meta.client_hint == client_hint);
        if unchanged {
            return Ok(meta);
        }
        let (_, meta) = self
            .with_metadata(meta.agent_id, |m| {
                m.binding = Some(ActiveBinding {
                    session_key: session.clone(),
                    bound_at: now,
                });
                if client_hint.is_some() {
                    m.client_hint = client_hint.clone();
                }
                Ok(())
            })
            .await?;
        Ok(meta)
    }

    async fn create(
        &self,
        new: NewAgent,
        now: DateTime<Utc>,
        config: &GovernanceConfig,
    ) -> Result<AgentMetadata> {
        let name_key = new.name.as_deref().map(naming::name_key);
        if let Some(key) = &name_key {
            if self.display_ids.contains_key(new.name.as_deref().unwrap_or_default()) {
                return Err(Error::Conflict(format!("name {:?} is taken", key)));
            }
            match self.names.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::Conflict(format!("name {:?} is taken", key)));
                }
                Entry::Vacant(slot) => {
                    slot.insert(new.id);
                }
            }
        }

        let identity = &config.identity;
        let mut suffix_len = 6;
        let display_id = loop {
            let candidate = naming::display_id(
                &identity.display_template,
                &identity.display_prefix,
                now,
                new.id,
                suffix_len,
            );
            match self.display_ids.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(new.id);
                    break candidate;
                }
                Entry::Occupied(_) if suffix_len < 32 => suffix_len += 2,
                Entry::Occupied(_) => {
                    self.unclaim_name(name_key.as_deref(), new.id);
                    return Err(Error::Internal("display id space exhausted".into()));
                }
            }
        };

        let mut meta = AgentMetadata::new(new.id, display_id.clone(), now);
        meta.display_name = new.name;
        meta.parent = new.parent;
        meta.spawn_reason = new.spawn_reason;
        meta.federated = new.federated;
        let kind = if meta.parent.is_some() {
            LifecycleEventKind::Spawned
        } else {
            LifecycleEventKind::Created
        };
        meta.record_event(kind, meta.spawn_reason.clone(), now, config.lifecycle.event_log_len);

        if let Err(e) = self.store.save_metadata(&meta).await {
            self.unclaim_name(name_key.as_deref(), new.id);
            self.display_ids.remove(&display_id);
            return Err(e);
        }
        self.events.lifecycle(meta.public_name(), kind, None);
        Ok(meta)
    }

    fn unclaim_name(&self, key: Option<&str>, id: AgentId) {
        if let Some(key) = key {
            self.names.remove_if(key, |_, owner| *owner == id);
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Live metadata. Missing or deleted agents are `NotFound`.
    pub async fn metadata(&self, id: AgentId) -> Result<AgentMetadata> {
        match self.store.load_metadata(id).await? {
            Some(meta) if meta.status != LifecycleStatus::Deleted => Ok(meta),
            _ => Err(Error::NotFound(format!("agent {id}"))),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AgentMetadata>> {
        let id = self
            .names
            .get(&naming::name_key(name))
            .map(|e| *e.value())
            .or_else(|| self.display_ids.get(name.trim()).map(|e| *e.value()));
        match id {
            Some(id) => match self.metadata(id).await {
                Ok(meta) => Ok(Some(meta)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// Find an agent by UUID, display id or display name.
    pub async fn lookup(&self, key: &str) -> Result<AgentMetadata> {
        if let Some(id) = AgentId::parse(key) {
            return self.metadata(id).await;
        }
        self.find_by_name(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent {key:?}")))
    }

    /// All agents except deleted ones, optionally filtered by status.
    pub async fn list(&self, status: Option<LifecycleStatus>) -> Result<Vec<AgentMetadata>> {
        let mut metas: Vec<AgentMetadata> = self
            .store
            .list_metadata()
            .await?
            .into_iter()
            .filter(|m| match status {
                Some(s) => m.status == s,
                None => m.status != LifecycleStatus::Deleted,
            })
            .collect();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Read-modify-write of one agent's metadata under its lock.
    pub async fn with_metadata<T, F>(&self, id: AgentId, f: F) -> Result<(T, AgentMetadata)>
    where
        F: FnOnce(&mut AgentMetadata) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.locks.lock(id).await?;
        let mut meta = self.metadata(id).await?;
        let out = f(&mut meta)?;
        self.store.save_metadata(&meta).await?;
        Ok((out, meta))
    }

    /// Explicit rename. Names are unique case-insensitively and may not
    /// shadow another agent's display id.
    pub async fn set_name(&self, id: AgentId, raw: &str) -> Result<AgentMetadata> {
        let config = self.config.current();
        let name = naming::validate_name(raw, config.identity.name_max_len)?;
        let key = naming::name_key(&name);

        if self.display_ids.get(&name).is_some_and(|owner| *owner != id) {
            return Err(Error::Conflict(format!("name {name:?} is taken")));
        }
        match self.names.entry(key.clone()) {
            Entry::Occupied(owner) if *owner.get() != id => {
                return Err(Error::Conflict(format!("name {name:?} is taken")));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let now = self.clock.now();
        let cap = config.lifecycle.event_log_len;
        let result = self
            .with_metadata(id, |m| {
                let previous = m.display_name.replace(name.clone());
                if previous.as_deref() != Some(name.as_str()) {
                    m.record_event(LifecycleEventKind::Renamed, Some(name.clone()), now, cap);
                }
                Ok(previous)
            })
            .await;

        match result {
            Ok((previous, meta)) => {
                if let Some(old) = previous.map(|p| naming::name_key(&p)).filter(|old| *old != key) {
                    self.names.remove_if(&old, |_, owner| *owner == id);
                    self.events
                        .lifecycle(&meta.display_id, LifecycleEventKind::Renamed, Some(&name));
                }
                Ok(meta)
            }
            Err(e) => {
                let keep = self
                    .store
                    .load_metadata(id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|m| m.display_name)
                    .is_some_and(|n| naming::name_key(&n) == key);
                if !keep {
                    self.names.remove_if(&key, |_, owner| *owner == id);
                }
                Err(e)
            }
        }
    }

    pub async fn set_label(&self, id: AgentId, label: Option<&str>) -> Result<AgentMetadata> {
        let label = label.map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);
        if label.as_ref().is_some_and(|l| l.chars().count() > 256) {
            return Err(Error::InvalidArgument("label longer than 256 characters".into()));
        }
        let (_, meta) = self
            .with_metadata(id, |m| {
                m.label = label;
                Ok(())
            })
            .await?;
        Ok(meta)
    }

    /// Create a child agent with lineage back to `parent`.
    pub async fn spawn(
        &self,
        parent: AgentId,
        name: Option<&str>,
        reason: &str,
    ) -> Result<AgentMetadata> {
        let config = self.config.current();
        let parent_meta = self.metadata(parent).await?;
        let name = name
            .map(|n| naming::validate_name(n, config.identity.name_max_len))
            .transpose()?;
        let new = NewAgent {
            id: AgentId::new(),
            name,
            parent: Some(parent),
            spawn_reason: Some(reason.to_string()),
            federated: None,
        };
        let child = self.create(new, self.clock.now(), &config).await?;
        info!("{} spawned {} ({})", parent_meta.public_name(), child.public_name(), reason);
        Ok(child)
    }

    /// Drop bindings and the name claim of a deleted agent.
    pub fn forget(&self, meta: &AgentMetadata) {
        self.bindings.retain(|_, b| b.agent_id != meta.agent_id);
        if let Some(name) = &meta.display_name {
            self.names
                .remove_if(&naming::name_key(name), |_, owner| *owner == meta.agent_id);
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}
