//! Dialectic coordinator
//!
//! Owns session persistence and the lifecycle effects of a resolution.
//! Operations on one session are serialized by a per-session gate; writes
//! additionally hold the paused agent's lock. Timeouts are applied lazily on
//! every access and by the background sweeper.

use crate::delegate::{delegate_from_config, DraftRequest, PlaceholderDelegate, ReasoningDelegate};
use crate::discovery::{self, DiscoveryRecord};
use crate::protocol::{self, Rules, Submission};
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use eisv_core::config::DialecticConfig;
use eisv_core::{
    AgentId, ConfigHandle, DialecticContent, DialecticId, DialecticSession, Error, EventBus,
    EventMessage, GovernanceConfig, LifecycleEventKind, LifecycleStatus, MessageType, Resolution,
    ResolutionOutcome, Result, SessionType, SharedClock,
};
use eisv_engine::Governor;
use eisv_lock::LockManager;
use eisv_store::SharedStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub paused_agent: AgentId,
    pub reason: String,
    pub session_type: SessionType,
    /// Explicit reviewer; otherwise one is picked from recently active peers.
    pub reviewer: Option<AgentId>,
}

impl OpenRequest {
    pub fn review(paused_agent: AgentId, reason: impl Into<String>) -> Self {
        Self {
            paused_agent,
            reason: reason.into(),
            session_type: SessionType::Review,
            reviewer: None,
        }
    }
}

/// A delegate draft running in the background.
#[derive(Debug)]
pub struct DraftTicket {
    pub kind: MessageType,
    pub author: String,
    pub handle: JoinHandle<Result<DialecticSession>>,
}

enum DelegateSlot {
    /// Built from the dialectic config section it was keyed on.
    Configured {
        url: Option<String>,
        timeout_ms: u64,
        delegate: Arc<dyn ReasoningDelegate>,
    },
    /// Installed through `with_delegate`; survives reloads.
    Pinned(Arc<dyn ReasoningDelegate>),
}

impl DelegateSlot {
    fn keyed(config: &DialecticConfig, delegate: Arc<dyn ReasoningDelegate>) -> Self {
        Self::Configured {
            url: config.delegate_url.clone(),
            timeout_ms: config.delegate_timeout_ms,
            delegate,
        }
    }

    /// The delegate when it still matches `config`.
    fn current(&self, config: &DialecticConfig) -> Option<Arc<dyn ReasoningDelegate>> {
        match self {
            Self::Pinned(d) => Some(d.clone()),
            Self::Configured { url, timeout_ms, delegate }
                if *url == config.delegate_url && *timeout_ms == config.delegate_timeout_ms =>
            {
                Some(delegate.clone())
            }
            Self::Configured { .. } => None,
        }
    }
}

pub struct DialecticCoordinator {
    store: SharedStore,
    governor: Arc<Governor>,
    locks: Arc<LockManager>,
    config: ConfigHandle,
    clock: SharedClock,
    events: EventBus,
    delegate: RwLock<DelegateSlot>,
    gates: DashMap<DialecticId, Arc<Mutex<()>>>,
}

impl DialecticCoordinator {
    pub fn new(
        store: SharedStore,
        governor: Arc<Governor>,
        locks: Arc<LockManager>,
        config: ConfigHandle,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        let current = config.current();
        let delegate = delegate_from_config(&current.dialectic);
        let delegate = RwLock::new(DelegateSlot::keyed(&current.dialectic, delegate));
        Self {
            store,
            governor,
            locks,
            config,
            clock,
            events,
            delegate,
            gates: DashMap::new(),
        }
    }

    pub fn with_delegate(self, delegate: Arc<dyn ReasoningDelegate>) -> Self {
        Self {
            delegate: RwLock::new(DelegateSlot::Pinned(delegate)),
            ..self
        }
    }

    pub fn delegate_name(&self) -> String {
        self.delegate(&self.config.current().dialectic).name().to_string()
    }

    /// Delegate for the live config, rebuilt after a reload changed its
    /// endpoint or timeout.
    fn delegate(&self, config: &DialecticConfig) -> Arc<dyn ReasoningDelegate> {
        if let Ok(slot) = self.delegate.read() {
            if let Some(d) = slot.current(config) {
                return d;
            }
        }
        let built = delegate_from_config(config);
        if let Ok(mut slot) = self.delegate.write() {
            if let Some(d) = slot.current(config) {
                return d;
            }
            *slot = DelegateSlot::keyed(config, built.clone());
        }
        debug!("reasoning delegate rebuilt: {}", built.name());
        built
    }

    fn gate(&self, id: DialecticId) -> Arc<Mutex<()>> {
        self.gates
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, id: DialecticId) -> Result<DialecticSession> {
        self.store
            .load_dialectic(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dialectic {id}")))
    }

    async fn save(&self, session: &DialecticSession) -> Result<()> {
        let _guard = self.locks.lock(session.paused_agent).await?;
        self.store.save_dialectic(session).await
    }

    fn publish(&self, session: &DialecticSession) {
        self.events.publish(EventMessage::dialectic(
            &session.id.to_string(),
            session.status.as_str(),
        ));
    }

    async fn display(&self, id: AgentId) -> String {
        match self.governor.registry().metadata(id).await {
            Ok(meta) => meta.public_name().to_string(),
            Err(_) => id.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    pub async fn open(&self, req: OpenRequest) -> Result<DialecticSession> {
        let config = self.config.current();
        let registry = self.governor.registry();
        let paused = req.paused_agent;
        let meta = registry.metadata(paused).await?;
        if meta.status == LifecycleStatus::Archived {
            return Err(Error::InvalidState(format!(
                "{} is archived",
                meta.public_name()
            )));
        }
        if let Some(reviewer) = req.reviewer {
            if reviewer == paused && !config.dialectic.allow_self_review {
                return Err(Error::InvalidArgument("self-review is disabled".into()));
            }
            registry.metadata(reviewer).await?;
        }

        if req.session_type == SessionType::Review {
            if let Some(existing) = self.open_review_for(paused).await? {
                debug!("dialectic {} already open for {}", existing.id, meta.public_name());
                return Ok(existing);
            }
        }

        let reviewer = match req.reviewer {
            Some(r) => Some(r),
            None => self.pick_reviewer(paused, &config).await?,
        };
        let mut session = DialecticSession::new(paused, req.session_type, req.reason, self.clock.now());
        session.reviewer = reviewer;
        self.save(&session).await?;

        if session.session_type == SessionType::Review
            && matches!(meta.status, LifecycleStatus::Active | LifecycleStatus::WaitingInput)
        {
            self.governor.pause(paused, "explicit dialectic request").await?;
        }
        self.governor
            .note(paused, LifecycleEventKind::DialecticOpened, Some(session.id.to_string()))
            .await?;

        let reviewer_name = match reviewer {
            Some(r) => self.display(r).await,
            None => "unassigned".to_string(),
        };
        info!(
            "dialectic {} opened for {} (reviewer: {})",
            session.id,
            meta.public_name(),
            reviewer_name
        );
        self.publish(&session);
        Ok(session)
    }

    async fn open_review_for(&self, agent: AgentId) -> Result<Option<DialecticSession>> {
        Ok(self.store.list_dialectic().await?.into_iter().find(|s| {
            s.paused_agent == agent
                && s.session_type == SessionType::Review
                && !s.status.is_terminal()
        }))
    }

    /// Most recently updated active peer, not cooling down, inside the
    /// recency window.
    async fn pick_reviewer(&self, paused: AgentId, config: &GovernanceConfig) -> Result<Option<AgentId>> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::seconds(config.dialectic.reviewer_recency_secs as i64);
        let peer = self
            .governor
            .registry()
            .list(Some(LifecycleStatus::Active))
            .await?
            .into_iter()
            .filter(|m| {
                m.agent_id != paused
                    && !m.in_cooldown(now)
                    && m.last_update_at.is_some_and(|t| t >= cutoff)
            })
            .max_by_key(|m| m.last_update_at)
            .map(|m| m.agent_id);
        Ok(peer)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn submit(
        &self,
        id: DialecticId,
        author: AgentId,
        kind: MessageType,
        content: DialecticContent,
    ) -> Result<DialecticSession> {
        let gate = self.gate(id);
        let _gate = gate.lock().await;
        let config = self.config.current();
        let author_meta = self.governor.registry().metadata(author).await?;
        let mut session = self.refresh_locked(id, &config).await?;

        let submission = Submission {
            kind,
            author,
            author_display: author_meta.public_name().to_string(),
            content,
        };
        protocol::submit(
            &mut session,
            submission,
            &Rules::from_config(&config.dialectic),
            self.clock.now(),
        )?;
        self.save(&session).await?;
        debug!(
            "dialectic {} #{} {} by {}",
            id,
            session.next_seq - 1,
            kind.as_str(),
            author_meta.public_name()
        );
        self.publish(&session);

        if session.status.is_terminal() {
            self.finalize(&mut session, &config).await?;
        }
        Ok(session)
    }

    /// Outcome of a terminal session. Idempotent; a live session is not ready.
    pub async fn resolve(&self, id: DialecticId) -> Result<Resolution> {
        let gate = self.gate(id);
        let _gate = gate.lock().await;
        let config = self.config.current();
        let session = self.refresh_locked(id, &config).await?;
        session.resolution.ok_or_else(|| {
            Error::InvalidState(format!(
                "dialectic {} not ready: {}",
                id,
                session.status.as_str()
            ))
        })
    }

    pub async fn get(&self, id: DialecticId) -> Result<DialecticSession> {
        let gate = self.gate(id);
        let _gate = gate.lock().await;
        self.refresh_locked(id, &self.config.current()).await
    }

    /// Sessions where `agent` is the paused party or the reviewer; all
    /// sessions when `agent` is `None`. Oldest first.
    pub async fn list(&self, agent: Option<AgentId>) -> Result<Vec<DialecticSession>> {
        let ids: Vec<DialecticId> = self
            .store
            .list_dialectic()
            .await?
            .into_iter()
            .filter(|s| match agent {
                Some(a) => s.paused_agent == a || s.reviewer == Some(a),
                None => true,
            })
            .map(|s| s.id)
            .collect();
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            sessions.push(self.get(id).await?);
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Load, apply a due timeout and settle an unresolved terminal session.
    /// The caller holds the session gate.
    async fn refresh_locked(&self, id: DialecticId, config: &GovernanceConfig) -> Result<DialecticSession> {
        let mut session = self.load(id).await?;
        let timeout = ChronoDuration::seconds(config.dialectic.inactivity_timeout_secs as i64);
        let was = session.status;
        if protocol::expire_if_idle(&mut session, self.clock.now(), timeout) {
            info!("dialectic {} timed out in {}", id, was.as_str());
            self.save(&session).await?;
            self.publish(&session);
        }
        if session.status.is_terminal() && !session.resolution.as_ref().is_some_and(|r| r.applied) {
            self.finalize(&mut session, config).await?;
        }
        Ok(session)
    }

    /// Settle a terminal session in two persisted steps: the decided outcome
    /// is saved unapplied, then applied to the paused agent and marked. A
    /// fault in either step leaves the session to be settled on next access,
    /// and the governor applies each session to an agent at most once.
    async fn finalize(&self, session: &mut DialecticSession, config: &GovernanceConfig) -> Result<()> {
        let paused = session.paused_agent;
        let coherence = match self.governor.state(paused).await {
            Ok(state) => Some(state.coherence),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if session.resolution.is_none() {
            let (outcome, reason) = match coherence {
                Some(c) => protocol::decide_outcome(
                    session,
                    c,
                    config.decision.coherence_critical_threshold,
                    &config.dialectic.forbidden_conditions,
                ),
                None => (
                    ResolutionOutcome::Escalate,
                    "paused agent no longer exists".to_string(),
                ),
            };
            session.resolution = Some(Resolution {
                outcome,
                reason,
                decided_at: self.clock.now(),
                applied: false,
            });
            self.save(session).await?;
        }

        let Some(resolution) = session.resolution.clone().filter(|r| !r.applied) else {
            return Ok(());
        };
        if coherence.is_some() {
            let lifecycle = session.session_type == SessionType::Review;
            self.governor
                .apply_resolution(paused, session.id, &resolution, lifecycle)
                .await?;
        }
        if let Some(r) = session.resolution.as_mut() {
            r.applied = true;
        }
        self.save(session).await?;

        let paused_name = self.display(paused).await;
        let reviewer_name = match session.reviewer {
            Some(r) => Some(self.display(r).await),
            None => None,
        };
        let record = DiscoveryRecord::from_session(session, &paused_name, reviewer_name.as_deref());
        discovery::record(config.dialectic.discovery_log.as_ref(), &record).await;

        info!(
            "dialectic {} for {}: {} ({})",
            session.id,
            paused_name,
            resolution.outcome.as_str(),
            resolution.reason
        );
        self.publish(session);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Time out idle sessions. Returns how many closed.
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let live: Vec<DialecticId> = self
            .store
            .list_dialectic()
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
            .collect();
        let mut closed = 0;
        for id in live {
            match self.get(id).await {
                Ok(s) if s.status.is_terminal() => closed += 1,
                Ok(_) => {}
                Err(e) => warn!("dialectic sweep of {} failed: {}", id, e),
            }
        }
        self.gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        Ok(closed)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let secs = coordinator.config.current().dialectic.sweep_interval_secs.max(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        match coordinator.sweep_timeouts().await {
                            Ok(n) if n > 0 => info!("dialectic sweep closed {} session(s)", n),
                            Ok(_) => {}
                            Err(e) => warn!("dialectic sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Delegate drafts
    // ------------------------------------------------------------------

    /// Draft the next message through the reasoning delegate in the
    /// background. A failing or slow delegate yields a placeholder draft.
    pub async fn request_draft(self: &Arc<Self>, id: DialecticId) -> Result<DraftTicket> {
        let config = self.config.current();
        let session = self.get(id).await?;
        let rules = Rules::from_config(&config.dialectic);
        let (kind, author) = protocol::next_step(&session, &rules).ok_or_else(|| {
            Error::InvalidState(format!(
                "dialectic {} has no draftable step while {}",
                id,
                session.status.as_str()
            ))
        })?;
        let author_name = self.governor.registry().metadata(author).await?.public_name().to_string();
        let metrics = match self.governor.get_metrics(session.paused_agent).await {
            Ok(m) => serde_json::to_value(m)?,
            Err(_) => serde_json::Value::Null,
        };

        let request = DraftRequest {
            session: id.to_string(),
            kind,
            reason: session.reason.clone(),
            author: author_name.clone(),
            messages: session.messages.clone(),
            metrics,
        };
        let timeout = Duration::from_millis(config.dialectic.delegate_timeout_ms);
        let delegate = self.delegate(&config.dialectic);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let content = match tokio::time::timeout(timeout, delegate.draft(&request)).await {
                Ok(Ok(content)) => content,
                Ok(Err(e)) => {
                    warn!("delegate {} failed for {}: {}", delegate.name(), request.session, e);
                    PlaceholderDelegate::build(&request)
                }
                Err(_) => {
                    warn!("delegate {} timed out for {}", delegate.name(), request.session);
                    PlaceholderDelegate::build(&request)
                }
            };
            let result = this.submit(id, author, kind, content).await;
            if let Err(e) = &result {
                warn!("draft for dialectic {} not submitted: {}", id, e);
            }
            result
        });

        Ok(DraftTicket {
            kind,
            author: author_name,
            handle,
        })
    }
}
