use eisv_core::config::HealthConfig;
use eisv_core::{AgentState, HealthStatus, StateHistory};

/// Longer-horizon status from the mean recent risk and current coherence.
pub fn health_status(state: &AgentState, cfg: &HealthConfig) -> HealthStatus {
    if state.history.is_empty() {
        return HealthStatus::Unknown;
    }
    let recent: Vec<f64> = StateHistory::tail(&state.history.risk, cfg.window).collect();
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;

    if state.coherence < cfg.coherence_floor || mean >= cfg.risk_moderate {
        HealthStatus::Critical
    } else if mean >= cfg.risk_healthy {
        HealthStatus::Moderate
    } else {
        HealthStatus::Healthy
    }
}
