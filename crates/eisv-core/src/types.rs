//! Core identifiers and enums shared across the governance service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use uuid::Uuid;

/// Persistent agent identity. Internal only, never shown to peers.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a UUID string; anything else is not an agent id.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport session key - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Dialectic session identifier
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialecticId(Uuid);

impl DialecticId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for DialecticId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DialecticId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent lifecycle status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Active,
    WaitingInput,
    Paused,
    Archived,
    Deleted,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingInput => "waiting_input",
            Self::Paused => "paused",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "waiting_input" => Some(Self::WaitingInput),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Statuses the next update silently returns to `active`.
    pub fn resumes_on_update(&self) -> bool {
        matches!(self, Self::Archived | Self::WaitingInput)
    }
}

/// Governance verdict
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Revise,
    Reject,
}

impl Decision {
    pub fn action(&self) -> Action {
        match self {
            Self::Approve => Action::Proceed,
            Self::Revise => Action::Caution,
            Self::Reject => Action::Pause,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject)
    }
}

/// Caller-facing action paired with every decision
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Proceed,
    Caution,
    Pause,
}

/// Machine-readable reason attached to every verdict
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Approved,
    ReviseGuidance,
    RiskTooHigh,
    CoherenceCritical,
    VoidActive,
    Paused,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ReviseGuidance => "revise_guidance",
            Self::RiskTooHigh => "risk_too_high",
            Self::CoherenceCritical => "coherence_critical",
            Self::VoidActive => "void_active",
            Self::Paused => "paused",
        }
    }
}

/// Longer-horizon health classification
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Moderate,
    Critical,
    Unknown,
}

/// Kind of a lifecycle event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Created,
    Spawned,
    Resumed,
    Paused,
    LoopDetected,
    CooldownCleared,
    ResponseComplete,
    Archived,
    Deleted,
    Renamed,
    DialecticOpened,
    DialecticResolved,
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Spawned => "spawned",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::LoopDetected => "loop_detected",
            Self::CooldownCleared => "cooldown_cleared",
            Self::ResponseComplete => "response_complete",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
            Self::DialecticOpened => "dialectic_opened",
            Self::DialecticResolved => "dialectic_resolved",
        }
    }
}

/// One entry of an agent's lifecycle event log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    pub kind: LifecycleEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
