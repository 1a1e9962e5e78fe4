//! Governor: the stateful front of the engine
//!
//! Every mutation of an agent's state or metadata happens while holding that
//! agent's lock from the [`LockManager`]. Reads go through a short TTL cache.

use crate::circuit;
use crate::controller::{sampling_params, SamplingParams};
use crate::decision::Verdict;
use crate::health::health_status;
use crate::monitor::evaluate;
use crate::report::UpdateReport;
use crate::risk::{RiskBreakdown, RiskScorer};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use eisv_core::{
    AgentId, AgentMetadata, AgentState, ConfigHandle, Decision, DialecticId, Error, EventBus,
    GovernanceConfig, HealthStatus, LifecycleEventKind, LifecycleStatus, Resolution,
    ResolutionOutcome, Result, SharedClock, UpdateStamp,
};
use eisv_identity::IdentityRegistry;
use eisv_lock::LockManager;
use eisv_store::{SharedStore, TtlCache};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub agent: String,
    #[serde(rename = "E")]
    pub e: f64,
    #[serde(rename = "I")]
    pub i: f64,
    #[serde(rename = "S")]
    pub s: f64,
    #[serde(rename = "V")]
    pub v: f64,
    pub coherence: f64,
    pub risk: f64,
    pub lambda1: f64,
    pub void_active: bool,
    pub void_threshold: f64,
    pub health_status: HealthStatus,
    pub update_count: u64,
    pub time: f64,
    pub status: LifecycleStatus,
}

impl MetricsSnapshot {
    fn build(state: &AgentState, meta: &AgentMetadata, config: &GovernanceConfig) -> Self {
        Self {
            agent: meta.public_name().to_string(),
            e: state.e,
            i: state.i,
            s: state.s,
            v: state.v,
            coherence: state.coherence,
            risk: state.risk,
            lambda1: state.lambda1,
            void_active: state.void_active,
            void_threshold: state.void_threshold,
            health_status: health_status(state, &config.health),
            update_count: state.update_count,
            time: state.time,
            status: meta.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResponse {
    pub agent: String,
    pub decision: Verdict,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_breakdown: Option<RiskBreakdown>,
    pub sampling_params: SamplingParams,
    pub simulated: bool,
}

/// Tag edit. `set` replaces the whole set before `add`/`remove` apply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TagUpdate {
    pub set: Option<Vec<String>>,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl TagUpdate {
    fn apply(&self, meta: &mut AgentMetadata) {
        if let Some(set) = &self.set {
            meta.tags = set.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
        }
        for tag in &self.add {
            let tag = tag.trim();
            if !tag.is_empty() {
                meta.tags.insert(tag.to_string());
            }
        }
        for tag in &self.remove {
            meta.tags.remove(tag.trim());
        }
    }
}

type PendingEvent = (LifecycleEventKind, Option<String>);

pub struct Governor {
    store: SharedStore,
    locks: Arc<LockManager>,
    registry: Arc<IdentityRegistry>,
    config: ConfigHandle,
    clock: SharedClock,
    events: EventBus,
    scorer: RwLock<Arc<RiskScorer>>,
    metrics_cache: TtlCache<AgentId, MetricsSnapshot>,
}

impl Governor {
    pub fn new(
        store: SharedStore,
        locks: Arc<LockManager>,
        registry: Arc<IdentityRegistry>,
        config: ConfigHandle,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        let current = config.current();
        let scorer = RwLock::new(Arc::new(RiskScorer::new(&current.risk)));
        let metrics_cache = TtlCache::new(Duration::from_millis(current.storage.cache_ttl_ms));
        Self {
            store,
            locks,
            registry,
            config,
            clock,
            events,
            scorer,
            metrics_cache,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Arc<GovernanceConfig> {
        self.config.current()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Scorer for the live config, rebuilt after a reload changed the risk section.
    fn scorer(&self, config: &GovernanceConfig) -> Arc<RiskScorer> {
        if let Ok(current) = self.scorer.read() {
            if current.matches_config(&config.risk) {
                return current.clone();
            }
        }
        let fresh = Arc::new(RiskScorer::new(&config.risk));
        if let Ok(mut slot) = self.scorer.write() {
            *slot = fresh.clone();
        }
        debug!("risk scorer rebuilt");
        fresh
    }

    fn cache(&self, config: &GovernanceConfig) -> &TtlCache<AgentId, MetricsSnapshot> {
        self.metrics_cache.set_ttl(Duration::from_millis(config.storage.cache_ttl_ms));
        &self.metrics_cache
    }

    async fn load_state(&self, id: AgentId, config: &GovernanceConfig) -> Result<AgentState> {
        Ok(self
            .store
            .load_state(id)
            .await?
            .unwrap_or_else(|| AgentState::initial(id, &config.dynamics, &config.void_state)))
    }

    pub async fn state(&self, id: AgentId) -> Result<AgentState> {
        self.registry.metadata(id).await?;
        self.load_state(id, &self.config.current()).await
    }

    fn publish(&self, meta: &AgentMetadata, events: Vec<PendingEvent>) {
        for (kind, detail) in events {
            self.events.lifecycle(meta.public_name(), kind, detail.as_deref());
        }
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Run one governance cycle for `agent`. Safety outcomes are verdicts;
    /// only resolution, lock, circuit and storage faults are errors.
    pub async fn process_update(&self, agent: AgentId, report: &UpdateReport) -> Result<UpdateResponse> {
        let config = self.config.current();
        let guard = self.locks.lock(agent).await?;
        let now = self.clock.now();
        let cap = config.lifecycle.event_log_len;
        let mut meta = self.registry.metadata(agent).await?;
        let mut pending: Vec<PendingEvent> = Vec::new();

        if let Some(until) = meta.cooldown_until {
            if now < until {
                let remaining = ((until - now).num_milliseconds() + 999) / 1000;
                debug!("{} update refused, cooldown {}s", meta.public_name(), remaining);
                return Err(Error::loop_detected("cooldown", remaining.max(1) as u64));
            }
            meta.cooldown_until = None;
            meta.record_event(LifecycleEventKind::CooldownCleared, None, now, cap);
            pending.push((LifecycleEventKind::CooldownCleared, None));
        }

        if let Some(pattern) = circuit::detect(&meta.recent_updates, now, &config.circuit) {
            let secs = config.circuit.cooldown_secs;
            meta.cooldown_until = Some(now + ChronoDuration::seconds(secs as i64));
            let detail = format!("{pattern}, cooldown {secs}s");
            meta.record_event(LifecycleEventKind::LoopDetected, Some(detail.clone()), now, cap);
            self.store.save_metadata(&meta).await?;
            drop(guard);
            warn!("{} loop detected: {}", meta.public_name(), pattern);
            pending.push((LifecycleEventKind::LoopDetected, Some(detail)));
            self.publish(&meta, pending);
            return Err(Error::loop_detected(pattern.as_str(), secs));
        }

        let mut state = self.load_state(agent, &config).await?;
        let ring_len = config.circuit.ring_len;

        if meta.status == LifecycleStatus::Paused {
            meta.push_update(UpdateStamp { at: now, decision: Decision::Reject }, ring_len);
            self.store.save_metadata(&meta).await?;
            drop(guard);
            self.publish(&meta, pending);
            return Ok(UpdateResponse {
                agent: meta.public_name().to_string(),
                decision: Verdict::paused(meta.paused_reason.as_deref()),
                metrics: MetricsSnapshot::build(&state, &meta, &config),
                risk_breakdown: None,
                sampling_params: sampling_params(state.lambda1),
                simulated: false,
            });
        }

        if meta.status.resumes_on_update() {
            let from = meta.status.as_str().to_string();
            meta.status = LifecycleStatus::Active;
            meta.record_event(LifecycleEventKind::Resumed, Some(from.clone()), now, cap);
            pending.push((LifecycleEventKind::Resumed, Some(from)));
        }

        let scorer = self.scorer(&config);
        let eval = evaluate(&mut state, report, &config, &scorer);

        meta.push_update(UpdateStamp { at: now, decision: eval.verdict.decision }, ring_len);
        meta.last_update_at = Some(now);
        meta.total_updates += 1;
        if eval.verdict.decision.is_reject() {
            let reason = eval.verdict.reason.as_str().to_string();
            meta.status = LifecycleStatus::Paused;
            meta.paused_reason = Some(reason.clone());
            meta.record_event(LifecycleEventKind::Paused, Some(reason.clone()), now, cap);
            pending.push((LifecycleEventKind::Paused, Some(reason)));
        }

        self.store.save_update(&state, &meta).await?;
        let metrics = MetricsSnapshot::build(&state, &meta, &config);
        self.cache(&config).insert(agent, metrics.clone());
        drop(guard);

        debug!(
            "{} update #{}: {:?} risk={:.3} coherence={:.3}",
            meta.public_name(),
            state.update_count,
            eval.verdict.decision,
            eval.risk.total,
            state.coherence
        );
        self.publish(&meta, pending);

        Ok(UpdateResponse {
            agent: meta.public_name().to_string(),
            decision: eval.verdict,
            metrics,
            risk_breakdown: Some(eval.risk),
            sampling_params: eval.sampling,
            simulated: false,
        })
    }

    /// Evaluate a report against a copy of the current state. Nothing is
    /// persisted and the circuit is not consulted.
    pub async fn simulate_update(&self, agent: AgentId, report: &UpdateReport) -> Result<UpdateResponse> {
        let config = self.config.current();
        let meta = self.registry.metadata(agent).await?;
        let mut state = self.load_state(agent, &config).await?;
        let scorer = self.scorer(&config);
        let eval = evaluate(&mut state, report, &config, &scorer);
        Ok(UpdateResponse {
            agent: meta.public_name().to_string(),
            decision: eval.verdict,
            metrics: MetricsSnapshot::build(&state, &meta, &config),
            risk_breakdown: Some(eval.risk),
            sampling_params: eval.sampling,
            simulated: true,
        })
    }

    pub async fn get_metrics(&self, agent: AgentId) -> Result<MetricsSnapshot> {
        let config = self.config.current();
        if let Some(hit) = self.cache(&config).get(&agent) {
            return Ok(hit);
        }
        let meta = self.registry.metadata(agent).await?;
        let state = self.load_state(agent, &config).await?;
        let metrics = MetricsSnapshot::build(&state, &meta, &config);
        self.cache(&config).insert(agent, metrics.clone());
        Ok(metrics)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    async fn transition<F>(&self, agent: AgentId, f: F) -> Result<AgentMetadata>
    where
        F: FnOnce(&mut AgentMetadata, DateTime<Utc>) -> Result<Vec<PendingEvent>> + Send,
    {
        let now = self.clock.now();
        let cap = self.config.current().lifecycle.event_log_len;
        let (pending, meta) = self
            .registry
            .with_metadata(agent, |m| {
                let pending = f(m, now)?;
                for (kind, detail) in &pending {
                    m.record_event(*kind, detail.clone(), now, cap);
                }
                Ok(pending)
            })
            .await?;
        self.metrics_cache.invalidate(&agent);
        self.publish(&meta, pending);
        Ok(meta)
    }

    /// Active → waiting_input. The next update returns the agent to active.
    pub async fn mark_response_complete(&self, agent: AgentId) -> Result<AgentMetadata> {
        self.transition(agent, |m, _| match m.status {
            LifecycleStatus::Active => {
                m.status = LifecycleStatus::WaitingInput;
                Ok(vec![(LifecycleEventKind::ResponseComplete, None)])
            }
            LifecycleStatus::WaitingInput => Ok(Vec::new()),
            other => Err(Error::InvalidState(format!(
                "cannot complete a response while {}",
                other.as_str()
            ))),
        })
        .await
    }

    pub async fn archive(&self, agent: AgentId, reason: Option<&str>) -> Result<AgentMetadata> {
        let reason = reason.map(str::to_string);
        self.transition(agent, move |m, _| {
            if m.status == LifecycleStatus::Archived {
                return Ok(Vec::new());
            }
            m.status = LifecycleStatus::Archived;
            Ok(vec![(LifecycleEventKind::Archived, reason)])
        })
        .await
    }

    /// Soft delete. Protected agents are refused; bindings and the name
    /// claim are released.
    pub async fn delete(&self, agent: AgentId) -> Result<AgentMetadata> {
        let meta = self
            .transition(agent, |m, _| {
                if m.is_protected() {
                    return Err(Error::Conflict(format!("{} is protected", m.public_name())));
                }
                m.status = LifecycleStatus::Deleted;
                m.binding = None;
                Ok(vec![(LifecycleEventKind::Deleted, None)])
            })
            .await?;
        self.registry.forget(&meta);
        Ok(meta)
    }

    pub async fn pause(&self, agent: AgentId, reason: &str) -> Result<AgentMetadata> {
        let reason = reason.to_string();
        self.transition(agent, move |m, _| {
            if m.status == LifecycleStatus::Paused {
                return Ok(Vec::new());
            }
            m.status = LifecycleStatus::Paused;
            m.paused_reason = Some(reason.clone());
            Ok(vec![(LifecycleEventKind::Paused, Some(reason))])
        })
        .await
    }

    /// Apply a dialectic outcome to the paused agent at most once per session.
    /// Returns false when `session` had already been applied.
    pub async fn apply_resolution(
        &self,
        agent: AgentId,
        session: DialecticId,
        resolution: &Resolution,
        apply_lifecycle: bool,
    ) -> Result<bool> {
        let config = self.config.current();
        let cap = config.lifecycle.event_log_len;
        let cooldown_secs = config.circuit.cooldown_secs;
        let outcome = resolution.outcome;
        let reason = resolution.reason.clone();
        let mut fresh = false;
        let meta = self
            .transition(agent, |m, now| {
                if m.dialectic_applied(session) {
                    return Ok(Vec::new());
                }
                fresh = true;
                m.mark_dialectic_applied(session, cap);
                let mut pending = Vec::new();
                if apply_lifecycle {
                    match outcome {
                        ResolutionOutcome::Resume => {
                            m.status = LifecycleStatus::Active;
                            m.paused_reason = None;
                            m.cooldown_until = None;
                            m.recent_updates.clear();
                            pending.push((LifecycleEventKind::Resumed, Some(format!("dialectic {session}"))));
                        }
                        ResolutionOutcome::Cooldown => {
                            m.cooldown_until = Some(now + ChronoDuration::seconds(cooldown_secs as i64));
                            pending.push((
                                LifecycleEventKind::Paused,
                                Some(format!("cooldown {cooldown_secs}s: {reason}")),
                            ));
                        }
                        ResolutionOutcome::Escalate => {}
                    }
                }
                pending.push((
                    LifecycleEventKind::DialecticResolved,
                    Some(format!("{session} {}", outcome.as_str())),
                ));
                Ok(pending)
            })
            .await?;
        if fresh && apply_lifecycle && outcome == ResolutionOutcome::Resume {
            info!("{} resumed", meta.public_name());
        }
        Ok(fresh)
    }

    pub async fn update_tags(&self, agent: AgentId, update: &TagUpdate) -> Result<AgentMetadata> {
        let update = update.clone();
        self.transition(agent, move |m, _| {
            update.apply(m);
            Ok(Vec::new())
        })
        .await
    }

    /// Append an event to the agent's log without changing its status.
    pub async fn note(
        &self,
        agent: AgentId,
        kind: LifecycleEventKind,
        detail: Option<String>,
    ) -> Result<AgentMetadata> {
        self.transition(agent, move |_, _| Ok(vec![(kind, detail)])).await
    }

    /// Archive agents idle past the configured horizon. Protected agents and
    /// agents already paused stay as they are.
    pub async fn archive_inactive(&self) -> Result<usize> {
        let config = self.config.current();
        let hours = config.lifecycle.inactivity_archive_hours;
        if hours == 0 {
            return Ok(0);
        }
        let cutoff = self.clock.now() - ChronoDuration::hours(hours as i64);
        let candidates: Vec<AgentId> = self
            .registry
            .list(None)
            .await?
            .into_iter()
            .filter(|m| {
                matches!(m.status, LifecycleStatus::Active | LifecycleStatus::WaitingInput)
                    && !m.is_protected()
                    && m.last_active_at() < cutoff
            })
            .map(|m| m.agent_id)
            .collect();

        let mut archived = 0;
        for id in candidates {
            match self.archive(id, Some("inactivity")).await {
                Ok(_) => archived += 1,
                Err(e) => warn!("inactivity archive of {} failed: {}", id, e),
            }
        }
        if archived > 0 {
            info!("archived {} inactive agent(s)", archived);
        }
        Ok(archived)
    }
}
