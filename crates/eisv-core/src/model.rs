//! Persistent records: agent state, agent metadata, dialectic sessions

use crate::config::{DynamicsConfig, VoidConfig};
use crate::types::{
    AgentId, Decision, DialecticId, LifecycleEvent, LifecycleEventKind, LifecycleStatus,
    SessionKey,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

pub const PROTECTED_TAG: &str = "protected";

/// `C(V) = (Cmax / 2) * (1 + tanh(V))`
pub fn coherence(v: f64, c_max: f64) -> f64 {
    (c_max / 2.0) * (1.0 + v.tanh())
}

// ============================================================
// Agent state
// ============================================================

/// Rolling per-update series, each capped at the retention length.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateHistory {
    pub e: VecDeque<f64>,
    pub i: VecDeque<f64>,
    pub s: VecDeque<f64>,
    pub v: VecDeque<f64>,
    pub coherence: VecDeque<f64>,
    pub risk: VecDeque<f64>,
    pub void_active: VecDeque<bool>,
}

impl StateHistory {
    pub fn len(&self) -> usize {
        self.risk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.risk.is_empty()
    }

    /// Last `n` values of a series, oldest first.
    pub fn tail<T: Copy>(series: &VecDeque<T>, n: usize) -> impl Iterator<Item = T> + '_ {
        let skip = series.len().saturating_sub(n);
        series.iter().skip(skip).copied()
    }
}

fn push_capped<T>(series: &mut VecDeque<T>, value: T, cap: usize) {
    series.push_back(value);
    while series.len() > cap.max(1) {
        series.pop_front();
    }
}

/// EISV state vector of one agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub agent_id: AgentId,
    /// Energy, in [0, 1].
    pub e: f64,
    /// Information integrity, in [0, 1].
    pub i: f64,
    /// Entropy, in [0, 2].
    pub s: f64,
    /// Void (E/I imbalance accumulator).
    pub v: f64,
    pub coherence: f64,
    pub lambda1: f64,
    pub void_threshold: f64,
    pub void_active: bool,
    pub risk: f64,
    /// Logical time, advanced by `dt` per update.
    pub time: f64,
    pub update_count: u64,
    #[serde(default)]
    pub controller_integral: f64,
    #[serde(default)]
    pub history: StateHistory,
}

impl AgentState {
    pub fn initial(agent_id: AgentId, dynamics: &DynamicsConfig, void_cfg: &VoidConfig) -> Self {
        Self {
            agent_id,
            e: dynamics.initial_e,
            i: dynamics.initial_i,
            s: dynamics.initial_s,
            v: dynamics.initial_v,
            coherence: coherence(dynamics.initial_v, dynamics.c_max),
            lambda1: dynamics.initial_lambda1,
            void_threshold: void_cfg.band_max,
            void_active: false,
            risk: 0.0,
            time: 0.0,
            update_count: 0,
            controller_integral: 0.0,
            history: StateHistory::default(),
        }
    }

    /// Append the current values to every history series.
    pub fn record_history(&mut self, retention: usize) {
        let h = &mut self.history;
        push_capped(&mut h.e, self.e, retention);
        push_capped(&mut h.i, self.i, retention);
        push_capped(&mut h.s, self.s, retention);
        push_capped(&mut h.v, self.v, retention);
        push_capped(&mut h.coherence, self.coherence, retention);
        push_capped(&mut h.risk, self.risk, retention);
        push_capped(&mut h.void_active, self.void_active, retention);
    }
}

// ============================================================
// Agent metadata
// ============================================================

/// One entry of the loop-detection ring.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateStamp {
    pub at: DateTime<Utc>,
    pub decision: Decision,
}

/// Session currently bound to an agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActiveBinding {
    pub session_key: SessionKey,
    pub bound_at: DateTime<Utc>,
}

/// Federated identity source. The credential never leaves the service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FederatedSubject {
    pub issuer: String,
    pub subject: String,
    pub credential: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    pub agent_id: AgentId,
    pub display_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    pub status: LifecycleStatus,
    #[serde(default)]
    pub parent: Option<AgentId>,
    #[serde(default)]
    pub spawn_reason: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub recent_updates: VecDeque<UpdateStamp>,
    #[serde(default)]
    pub binding: Option<ActiveBinding>,
    /// Logical client hint from the last binding, used for rebinding.
    #[serde(default)]
    pub client_hint: Option<String>,
    #[serde(default)]
    pub federated: Option<FederatedSubject>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_reason: Option<String>,
    #[serde(default)]
    pub total_updates: u64,
    #[serde(default)]
    pub events: VecDeque<LifecycleEvent>,
    /// Dialectic sessions whose outcome has been applied, newest last.
    #[serde(default)]
    pub applied_dialectics: VecDeque<DialecticId>,
}

impl AgentMetadata {
    pub fn new(agent_id: AgentId, display_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            display_id: display_id.into(),
            display_name: None,
            label: None,
            status: LifecycleStatus::Active,
            parent: None,
            spawn_reason: None,
            tags: BTreeSet::new(),
            recent_updates: VecDeque::new(),
            binding: None,
            client_hint: None,
            federated: None,
            created_at: now,
            last_update_at: None,
            cooldown_until: None,
            paused_reason: None,
            total_updates: 0,
            events: VecDeque::new(),
            applied_dialectics: VecDeque::new(),
        }
    }

    /// Name used in logs and peer-facing views.
    pub fn public_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.display_id)
    }

    pub fn is_protected(&self) -> bool {
        self.tags.contains(PROTECTED_TAG)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Most recent activity: last update, else the binding, else creation.
    pub fn last_active_at(&self) -> DateTime<Utc> {
        let bound = self.binding.as_ref().map(|b| b.bound_at);
        [Some(self.created_at), self.last_update_at, bound]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }

    pub fn record_event(
        &mut self,
        kind: LifecycleEventKind,
        detail: Option<String>,
        at: DateTime<Utc>,
        cap: usize,
    ) {
        push_capped(&mut self.events, LifecycleEvent { at, kind, detail }, cap);
    }

    pub fn dialectic_applied(&self, id: DialecticId) -> bool {
        self.applied_dialectics.contains(&id)
    }

    pub fn mark_dialectic_applied(&mut self, id: DialecticId, cap: usize) {
        if !self.dialectic_applied(id) {
            push_capped(&mut self.applied_dialectics, id, cap);
        }
    }

    pub fn push_update(&mut self, stamp: UpdateStamp, ring_len: usize) {
        push_capped(&mut self.recent_updates, stamp, ring_len);
    }
}

// ============================================================
// Session binding
// ============================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionBinding {
    pub session_key: SessionKey,
    pub agent_id: AgentId,
    #[serde(default)]
    pub client_hint: Option<String>,
    pub bound_at: DateTime<Utc>,
}

// ============================================================
// Dialectic
// ============================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Review,
    Exploration,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DialecticStatus {
    Pending,
    Thesis,
    Antithesis,
    Negotiation,
    Resolved,
    Timeout,
}

impl DialecticStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Thesis => "thesis",
            Self::Antithesis => "antithesis",
            Self::Negotiation => "negotiation",
            Self::Resolved => "resolved",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Thesis,
    Antithesis,
    Synthesis,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thesis => "thesis",
            Self::Antithesis => "antithesis",
            Self::Synthesis => "synthesis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "thesis" => Some(Self::Thesis),
            "antithesis" => Some(Self::Antithesis),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }
}

/// Structured body of a dialectic message. Every field is optional on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DialecticContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proposed_conditions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_metrics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub concerns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agrees: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DialecticMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub author: AgentId,
    pub author_display: String,
    pub content: DialecticContent,
    pub at: DateTime<Utc>,
}

/// What both sides settled on during negotiation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Agreement {
    pub agreed: bool,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionOutcome {
    Resume,
    Cooldown,
    Escalate,
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "RESUME",
            Self::Cooldown => "COOLDOWN",
            Self::Escalate => "ESCALATE",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    /// Set once the outcome has reached the paused agent's lifecycle.
    #[serde(default)]
    pub applied: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DialecticSession {
    pub id: DialecticId,
    pub session_type: SessionType,
    pub status: DialecticStatus,
    pub paused_agent: AgentId,
    #[serde(default)]
    pub reviewer: Option<AgentId>,
    pub reason: String,
    #[serde(default)]
    pub messages: Vec<DialecticMessage>,
    #[serde(default)]
    pub next_seq: u64,
    #[serde(default)]
    pub synthesis_rounds: usize,
    #[serde(default)]
    pub agreement: Option<Agreement>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DialecticSession {
    pub fn new(
        paused_agent: AgentId,
        session_type: SessionType,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DialecticId::new(),
            session_type,
            status: DialecticStatus::Pending,
            paused_agent,
            reviewer: None,
            reason: reason.into(),
            messages: Vec::new(),
            next_seq: 1,
            synthesis_rounds: 0,
            agreement: None,
            resolution: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn last_message(&self, kind: MessageType) -> Option<&DialecticMessage> {
        self.messages.iter().rev().find(|m| m.kind == kind)
    }

    pub fn last_message_by(&self, kind: MessageType, author: AgentId) -> Option<&DialecticMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.kind == kind && m.author == author)
    }
}
