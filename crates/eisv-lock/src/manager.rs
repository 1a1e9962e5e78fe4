use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use eisv_core::config::{LockConfig, MAX_LOCK_RETRIES};
use eisv_core::{AgentId, ConfigHandle, Error, Result, SharedClock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque proof of lock ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct LockSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub stale_heartbeat: ChronoDuration,
    pub max_age: ChronoDuration,
}

impl LockSettings {
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            stale_heartbeat: ChronoDuration::seconds(config.stale_heartbeat_secs as i64),
            max_age: ChronoDuration::seconds(config.max_age_secs as i64),
        }
    }

    fn is_stale(&self, holder: &Holder, now: DateTime<Utc>) -> bool {
        now - holder.heartbeat_at > self.stale_heartbeat || now - holder.acquired_at > self.max_age
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

#[derive(Debug)]
struct Holder {
    token: LockToken,
    acquired_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Default)]
struct LockSlot {
    holder: Mutex<Option<Holder>>,
    released: Notify,
}

impl LockSlot {
    fn holder(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self, token: LockToken) -> bool {
        let mut holder = self.holder();
        if holder.as_ref().is_some_and(|h| h.token == token) {
            *holder = None;
            drop(holder);
            self.released.notify_waiters();
            true
        } else {
            false
        }
    }
}

/// In-process keyed lock manager.
///
/// Timeouts and staleness bounds are read from the live config on every
/// acquisition and reap, so a reload applies to the next caller.
pub struct LockManager {
    slots: DashMap<AgentId, Arc<LockSlot>>,
    clock: SharedClock,
    config: ConfigHandle,
    reclaimed: AtomicU64,
}

impl LockManager {
    pub fn new(config: ConfigHandle, clock: SharedClock) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            config,
            reclaimed: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> LockSettings {
        LockSettings::from_config(&self.config.current().lock)
    }

    /// Total locks reclaimed from dead or overdue holders.
    pub fn reclaimed_count(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self, agent: AgentId) -> bool {
        self.slots
            .get(&agent)
            .is_some_and(|slot| slot.holder().is_some())
    }

    fn slot(&self, agent: AgentId) -> Arc<LockSlot> {
        self.slots.entry(agent).or_default().value().clone()
    }

    /// Acquire with the configured timeout and retry count.
    pub async fn lock(&self, agent: AgentId) -> Result<LockGuard> {
        let settings = self.settings();
        self.acquire(agent, settings.timeout, settings.max_retries)
            .await
    }

    /// Acquire within `timeout`, split evenly across `max_retries + 1` attempts.
    /// `max_retries` is capped at [`MAX_LOCK_RETRIES`].
    pub async fn acquire(
        &self,
        agent: AgentId,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<LockGuard> {
        let slot = self.slot(agent);
        let max_retries = max_retries.min(MAX_LOCK_RETRIES);
        let per_attempt = timeout / (max_retries + 1);
        let started = tokio::time::Instant::now();

        for attempt in 0..=max_retries {
            let deadline = tokio::time::Instant::now() + per_attempt;
            loop {
                // Register before checking so a release in between is not missed
                let notified = slot.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(token) = self.try_take(agent, &slot) {
                    return Ok(LockGuard {
                        agent,
                        token,
                        slot: Some(Arc::clone(&slot)),
                        clock: self.clock.clone(),
                    });
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
            if attempt < max_retries {
                debug!("lock attempt {} for {} timed out, retrying", attempt + 1, agent);
            }
        }

        let waited_ms = started.elapsed().as_millis() as u64;
        warn!("lock timeout for {} after {}ms", agent, waited_ms);
        Err(Error::lock_timeout(agent.to_string(), waited_ms))
    }

    fn try_take(&self, agent: AgentId, slot: &LockSlot) -> Option<LockToken> {
        let now = self.clock.now();
        let settings = self.settings();
        let mut holder = slot.holder();
        if let Some(current) = holder.as_ref() {
            if !settings.is_stale(current, now) {
                return None;
            }
            self.log_reclaim(agent, current, now);
        }
        let token = LockToken(Uuid::new_v4());
        *holder = Some(Holder {
            token,
            acquired_at: now,
            heartbeat_at: now,
        });
        Some(token)
    }

    fn log_reclaim(&self, agent: AgentId, holder: &Holder, now: DateTime<Utc>) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "reclaiming lock for {} (held {}s, heartbeat {}s ago)",
            agent,
            (now - holder.acquired_at).num_seconds(),
            (now - holder.heartbeat_at).num_seconds()
        );
    }

    /// Release by token. Fails if `token` is not the current holder.
    pub fn release(&self, agent: AgentId, token: LockToken) -> Result<()> {
        let slot = self
            .slots
            .get(&agent)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::InvalidState(format!("no lock held for {agent}")))?;
        if slot.release(token) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "lock for {agent} is not held by token {token}"
            )))
        }
    }

    /// Refresh the heartbeat of a detached holder.
    pub fn heartbeat(&self, agent: AgentId, token: LockToken) -> Result<()> {
        let slot = self
            .slots
            .get(&agent)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::InvalidState(format!("no lock held for {agent}")))?;
        let mut holder = slot.holder();
        match holder.as_mut() {
            Some(h) if h.token == token => {
                h.heartbeat_at = self.clock.now();
                Ok(())
            }
            _ => Err(Error::InvalidState(format!("lock for {agent} is not held by token {token}"))),
        }
    }

    /// Reclaim stale holders and drop idle slots. Returns the number reclaimed.
    pub fn reap(&self) -> usize {
        let now = self.clock.now();
        let settings = self.settings();
        let mut reclaimed = 0;
        for entry in self.slots.iter() {
            let slot = entry.value();
            let mut holder = slot.holder();
            let stale = holder.as_ref().is_some_and(|h| settings.is_stale(h, now));
            if stale {
                if let Some(h) = holder.as_ref() {
                    self.log_reclaim(*entry.key(), h, now);
                }
                *holder = None;
                drop(holder);
                slot.released.notify_waiters();
                reclaimed += 1;
            }
        }
        self.slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.holder().is_some());
        reclaimed
    }

    /// Background reaper, runs until cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("lock reaper started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let n = manager.reap();
                        if n > 0 {
                            info!("lock reaper reclaimed {} lock(s)", n);
                        }
                    }
                }
            }
        })
    }
}

/// Held lock. Released on drop unless detached.
pub struct LockGuard {
    agent: AgentId,
    token: LockToken,
    slot: Option<Arc<LockSlot>>,
    clock: SharedClock,
}

impl LockGuard {
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn heartbeat(&self) {
        if let Some(slot) = &self.slot {
            let mut holder = slot.holder();
            if let Some(h) = holder.as_mut().filter(|h| h.token == self.token) {
                h.heartbeat_at = self.clock.now();
            }
        }
    }

    /// Give up RAII release; the holder must call [`LockManager::release`].
    pub fn detach(mut self) -> LockToken {
        self.slot = None;
        self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if !slot.release(self.token) {
                debug!("lock for {} was reclaimed before release", self.agent);
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("agent", &self.agent)
            .field("token", &self.token)
            .finish()
    }
}
