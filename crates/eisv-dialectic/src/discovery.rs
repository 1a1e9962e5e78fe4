//! Append-only discovery log of finished dialectic sessions

use chrono::{DateTime, Utc};
use eisv_core::{DialecticSession, Result, SessionType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// One JSON line per terminal session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryRecord {
    pub session: String,
    pub session_type: SessionType,
    pub paused_agent: String,
    pub reviewer: Option<String>,
    pub status: String,
    pub outcome: Option<String>,
    pub reason: Option<String>,
    pub root_cause: Option<String>,
    pub conditions: Vec<String>,
    pub messages: usize,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl DiscoveryRecord {
    pub fn from_session(session: &DialecticSession, paused: &str, reviewer: Option<&str>) -> Self {
        let agreement = session.agreement.as_ref();
        Self {
            session: session.id.to_string(),
            session_type: session.session_type,
            paused_agent: paused.to_string(),
            reviewer: reviewer.map(str::to_string),
            status: session.status.as_str().to_string(),
            outcome: session.resolution.as_ref().map(|r| r.outcome.as_str().to_string()),
            reason: session.resolution.as_ref().map(|r| r.reason.clone()),
            root_cause: agreement.and_then(|a| a.root_cause.clone()),
            conditions: agreement.map(|a| a.conditions.clone()).unwrap_or_default(),
            messages: session.messages.len(),
            opened_at: session.created_at,
            closed_at: session.resolved_at,
        }
    }
}

pub async fn append(path: &Path, record: &DiscoveryRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Append when a log path is configured. Failures are logged, never returned.
pub async fn record(path: Option<&PathBuf>, record: &DiscoveryRecord) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = append(path, record).await {
        warn!("discovery log {} append failed: {}", path.display(), e);
    }
}
