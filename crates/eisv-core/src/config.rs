//! Governance service configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup, then
//! `EISV_*` environment overrides are applied. Sections omitted from the file
//! fall back to their defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on `lock.max_retries`; each retry gets `timeout / (retries + 1)`.
pub const MAX_LOCK_RETRIES: u32 = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernanceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub dynamics: DynamicsConfig,
    pub risk: RiskConfig,
    pub decision: DecisionConfig,
    pub health: HealthConfig,
    pub void_state: VoidConfig,
    pub controller: ControllerConfig,
    pub circuit: CircuitConfig,
    pub lock: LockConfig,
    pub identity: IdentityConfig,
    pub dialectic: DialecticConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Shared transport token. Unset means no transport auth.
    pub auth_token: Option<String>,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_buffer: usize,
    /// Config file poll interval for hot reload, in milliseconds.
    pub reload_poll_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    /// Attempts for transient storage faults, including the first.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// TTL of the metrics read cache. 0 disables caching.
    pub cache_ttl_ms: u64,
    /// Entries kept per history series.
    pub history_retention: usize,
}

/// Coefficients of the EISV differential equations and the initial state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DynamicsConfig {
    pub alpha: f64,
    pub beta_e: f64,
    pub gamma_e: f64,
    pub k: f64,
    pub beta_i: f64,
    pub gamma_i: f64,
    pub mu: f64,
    pub lambda2: f64,
    pub kappa: f64,
    pub delta: f64,
    pub c_max: f64,
    pub dt: f64,
    pub initial_e: f64,
    pub initial_i: f64,
    pub initial_s: f64,
    pub initial_v: f64,
    pub initial_lambda1: f64,
    /// Scale applied to complexity in the drift vector.
    pub drift_complexity_gain: f64,
    /// Scale applied to `(1 - confidence)` in primary drift.
    pub drift_confidence_gain: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub weight_length: f64,
    pub weight_complexity: f64,
    pub weight_coherence: f64,
    pub weight_keyword: f64,
    /// Description length (chars) at which length risk is 0.5.
    pub reference_length: f64,
    pub length_scale: f64,
    pub keyword_hit_weight: f64,
    /// Case-insensitive regex patterns.
    pub blocklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub approve_threshold: f64,
    pub revise_threshold: f64,
    pub coherence_critical_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub risk_healthy: f64,
    pub risk_moderate: f64,
    pub coherence_floor: f64,
    pub window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoidConfig {
    pub band_min: f64,
    pub band_max: f64,
    pub window: usize,
    /// Below this many samples the threshold stays at `band_max`.
    pub min_samples: usize,
    pub sigma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Run the controller every N updates.
    pub interval: u64,
    pub window: usize,
    pub target_void_freq: f64,
    pub target_coherence: f64,
    pub kp: f64,
    pub ki: f64,
    pub integral_limit: f64,
    pub lambda1_min: f64,
    pub lambda1_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub ring_len: usize,
    pub rapid_fire_window_ms: u64,
    pub rapid_fire_count: usize,
    pub recursive_window_secs: u64,
    pub recursive_count: usize,
    pub recursive_rejects: usize,
    pub rapid_window_secs: u64,
    pub rapid_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub stale_heartbeat_secs: u64,
    pub max_age_secs: u64,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Prefix of generated display ids.
    pub display_prefix: String,
    /// `{prefix}`, `{date}` and `{suffix}` are substituted.
    pub display_template: String,
    pub rebind_lookback_secs: u64,
    pub snapshot_interval_secs: u64,
    /// Bind an unknown session to the single recently active agent.
    pub auto_bind_single_recent: bool,
    pub single_recent_window_secs: u64,
    /// Server secret for federated credentials. Unset disables federation.
    pub federated_secret: Option<String>,
    pub name_max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DialecticConfig {
    pub inactivity_timeout_secs: u64,
    pub max_negotiation_rounds: usize,
    pub sweep_interval_secs: u64,
    pub allow_self_review: bool,
    pub reviewer_recency_secs: u64,
    /// Case-insensitive substrings refused in agreed conditions.
    pub forbidden_conditions: Vec<String>,
    pub delegate_url: Option<String>,
    pub delegate_timeout_ms: u64,
    pub discovery_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// 0 disables the inactivity sweep.
    pub inactivity_archive_hours: u64,
    pub sweep_interval_secs: u64,
    pub event_log_len: usize,
}

// ============================================================
// Defaults
// ============================================================

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            dynamics: DynamicsConfig::default(),
            risk: RiskConfig::default(),
            decision: DecisionConfig::default(),
            health: HealthConfig::default(),
            void_state: VoidConfig::default(),
            controller: ControllerConfig::default(),
            circuit: CircuitConfig::default(),
            lock: LockConfig::default(),
            identity: IdentityConfig::default(),
            dialectic: DialecticConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8765,
            auth_token: None,
            event_buffer: 256,
            reload_poll_ms: 2_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            retry_attempts: 3,
            retry_backoff_ms: 50,
            cache_ttl_ms: 1_000,
            history_retention: 1_000,
        }
    }
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            beta_e: 0.1,
            gamma_e: 0.05,
            k: 0.1,
            beta_i: 0.3,
            gamma_i: 0.25,
            mu: 0.8,
            lambda2: 0.05,
            kappa: 0.3,
            delta: 0.4,
            c_max: 1.0,
            dt: 0.1,
            initial_e: 0.7,
            initial_i: 0.8,
            initial_s: 0.2,
            initial_v: 0.0,
            initial_lambda1: 0.3,
            drift_complexity_gain: 0.5,
            drift_confidence_gain: 0.3,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weight_length: 0.15,
            weight_complexity: 0.25,
            weight_coherence: 0.35,
            weight_keyword: 0.25,
            reference_length: 2_000.0,
            length_scale: 500.0,
            keyword_hit_weight: 0.5,
            blocklist: vec![
                r"ignore (all )?previous instructions".into(),
                r"disable (the )?(safety|governance)".into(),
                r"rm -rf /".into(),
                r"exfiltrat".into(),
                r"bypass (the )?(monitor|governance|review)".into(),
            ],
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            approve_threshold: 0.30,
            revise_threshold: 0.50,
            coherence_critical_threshold: 0.40,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { risk_healthy: 0.35, risk_moderate: 0.60, coherence_floor: 0.40, window: 10 }
    }
}

impl Default for VoidConfig {
    fn default() -> Self {
        Self { band_min: 0.10, band_max: 0.30, window: 100, min_samples: 10, sigma: 2.0 }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            window: 100,
            target_void_freq: 0.02,
            target_coherence: 0.55,
            kp: 0.10,
            ki: 0.02,
            integral_limit: 1.0,
            lambda1_min: 0.05,
            lambda1_max: 1.0,
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 30,
            ring_len: 10,
            rapid_fire_window_ms: 1_000,
            rapid_fire_count: 2,
            recursive_window_secs: 10,
            recursive_count: 3,
            recursive_rejects: 2,
            rapid_window_secs: 5,
            rapid_count: 4,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            max_retries: 2,
            stale_heartbeat_secs: 10,
            max_age_secs: 60,
            reap_interval_secs: 5,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_prefix: "agent".into(),
            display_template: "{prefix}_{date}_{suffix}".into(),
            rebind_lookback_secs: 300,
            snapshot_interval_secs: 30,
            auto_bind_single_recent: false,
            single_recent_window_secs: 300,
            federated_secret: None,
            name_max_len: 64,
        }
    }
}

impl Default for DialecticConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 1_800,
            max_negotiation_rounds: 5,
            sweep_interval_secs: 60,
            allow_self_review: true,
            reviewer_recency_secs: 3_600,
            forbidden_conditions: vec![
                "disable governance".into(),
                "disable monitoring".into(),
                "skip review".into(),
                "ignore thresholds".into(),
            ],
            delegate_url: None,
            delegate_timeout_ms: 10_000,
            discovery_log: None,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { inactivity_archive_hours: 72, sweep_interval_secs: 600, event_log_len: 50 }
    }
}

// ============================================================
// Loading
// ============================================================

impl GovernanceConfig {
    /// Load config from a TOML file. A missing file yields defaults; a file
    /// that fails to parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content)
                    .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load, apply environment overrides, validate.
    pub fn load_resolved(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Apply `EISV_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw);
                    None
                }
            }
        }

        if let Some(v) = lookup("EISV_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = parsed("EISV_PORT", lookup("EISV_PORT")) {
            self.server.port = v;
        }
        if let Some(v) = lookup("EISV_AUTH_TOKEN") {
            self.server.auth_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("EISV_STORAGE_BACKEND") {
            match v.as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "file" => self.storage.backend = StorageBackend::File,
                other => tracing::warn!("Ignoring EISV_STORAGE_BACKEND={:?}", other),
            }
        }
        if let Some(v) = lookup("EISV_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed("EISV_APPROVE_THRESHOLD", lookup("EISV_APPROVE_THRESHOLD")) {
            self.decision.approve_threshold = v;
        }
        if let Some(v) = parsed("EISV_REVISE_THRESHOLD", lookup("EISV_REVISE_THRESHOLD")) {
            self.decision.revise_threshold = v;
        }
        if let Some(v) = parsed("EISV_COHERENCE_CRITICAL", lookup("EISV_COHERENCE_CRITICAL")) {
            self.decision.coherence_critical_threshold = v;
        }
        if let Some(v) = parsed("EISV_LOCK_TIMEOUT_MS", lookup("EISV_LOCK_TIMEOUT_MS")) {
            self.lock.timeout_ms = v;
        }
        if let Some(v) = parsed("EISV_CIRCUIT_ENABLED", lookup("EISV_CIRCUIT_ENABLED")) {
            self.circuit.enabled = v;
        }
        if let Some(v) = lookup("EISV_FEDERATED_SECRET") {
            self.identity.federated_secret = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("EISV_DELEGATE_URL") {
            self.dialectic.delegate_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("EISV_DISCOVERY_LOG") {
            self.dialectic.discovery_log = Some(PathBuf::from(v));
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.risk;
        let sum = r.weight_length + r.weight_complexity + r.weight_coherence + r.weight_keyword;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::ConfigError(format!("risk weights sum to {sum}, expected 1.0")));
        }
        for w in [r.weight_length, r.weight_complexity, r.weight_coherence, r.weight_keyword] {
            if w < 0.0 {
                return Err(Error::ConfigError("risk weights must be non-negative".into()));
            }
        }
        if r.length_scale <= 0.0 {
            return Err(Error::ConfigError("risk.length_scale must be positive".into()));
        }
        for pattern in &r.blocklist {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(Error::ConfigError(format!("bad blocklist pattern {pattern:?}: {e}")));
            }
        }

        let d = &self.decision;
        if d.approve_threshold >= d.revise_threshold {
            return Err(Error::ConfigError(
                "decision.approve_threshold must be below revise_threshold".into(),
            ));
        }
        let h = &self.health;
        if h.risk_healthy >= h.risk_moderate {
            return Err(Error::ConfigError(
                "health.risk_healthy must be below risk_moderate".into(),
            ));
        }
        if h.window == 0 {
            return Err(Error::ConfigError("health.window must be positive".into()));
        }

        let v = &self.void_state;
        if v.band_min < 0.0 || v.band_min > v.band_max {
            return Err(Error::ConfigError("void_state band must satisfy 0 <= min <= max".into()));
        }
        if v.window == 0 {
            return Err(Error::ConfigError("void_state.window must be positive".into()));
        }

        let c = &self.controller;
        if c.interval == 0 || c.lambda1_min > c.lambda1_max {
            return Err(Error::ConfigError("controller interval/bounds invalid".into()));
        }
        if !(0.0..=1.0).contains(&c.lambda1_min) || !(0.0..=1.0).contains(&c.lambda1_max) {
            return Err(Error::ConfigError("controller lambda1 bounds must lie in [0, 1]".into()));
        }

        if self.dynamics.dt <= 0.0 || self.dynamics.c_max <= 0.0 || self.dynamics.c_max > 1.0 {
            return Err(Error::ConfigError("dynamics.dt must be positive and c_max in (0, 1]".into()));
        }
        if self.lock.timeout_ms == 0 || self.lock.max_age_secs == 0 {
            return Err(Error::ConfigError("lock timeouts must be positive".into()));
        }
        if self.lock.max_retries > MAX_LOCK_RETRIES {
            return Err(Error::ConfigError(format!(
                "lock.max_retries must be at most {MAX_LOCK_RETRIES}"
            )));
        }
        if self.circuit.ring_len == 0 {
            return Err(Error::ConfigError("circuit.ring_len must be positive".into()));
        }
        if self.dialectic.inactivity_timeout_secs == 0 {
            return Err(Error::ConfigError("dialectic.inactivity_timeout_secs must be positive".into()));
        }
        if self.storage.retry_attempts == 0 {
            return Err(Error::ConfigError("storage.retry_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
