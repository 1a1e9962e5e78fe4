//! Peer-safe projection of agent metadata

use chrono::{DateTime, Utc};
use eisv_core::{AgentMetadata, LifecycleEvent, LifecycleStatus};
use serde::Serialize;
use std::collections::BTreeSet;

/// What a caller may see about an agent. The UUID, lineage and event log
/// are only filled in for the agent's own session.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub display_id: String,
    pub display_name: Option<String>,
    pub label: Option<String>,
    pub status: LifecycleStatus,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub total_updates: u64,
    pub in_cooldown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<LifecycleEvent>,
}

impl AgentView {
    pub fn peer(meta: &AgentMetadata, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: None,
            display_id: meta.display_id.clone(),
            display_name: meta.display_name.clone(),
            label: meta.label.clone(),
            status: meta.status,
            tags: meta.tags.clone(),
            created_at: meta.created_at,
            last_update_at: meta.last_update_at,
            total_updates: meta.total_updates,
            in_cooldown: meta.in_cooldown(now),
            spawn_reason: None,
            cooldown_until: None,
            events: Vec::new(),
        }
    }

    pub fn owner(meta: &AgentMetadata, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: Some(meta.agent_id.to_string()),
            spawn_reason: meta.spawn_reason.clone(),
            cooldown_until: meta.cooldown_until,
            events: meta.events.iter().cloned().collect(),
            ..Self::peer(meta, now)
        }
    }
}
