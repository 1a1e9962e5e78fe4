//! Adaptive PI control of λ1 and advisory sampling parameters

use eisv_core::config::ControllerConfig;
use eisv_core::{AgentState, StateHistory};
use serde::Serialize;

/// Suggested generation parameters. Advisory only.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

pub fn sampling_params(lambda1: f64) -> SamplingParams {
    let l = lambda1.clamp(0.0, 1.0);
    SamplingParams {
        temperature: 0.5 + 0.7 * l,
        top_p: 0.85 + 0.10 * l,
        max_tokens: (100.0 + 400.0 * l).round() as u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerStep {
    pub observed_void_freq: f64,
    pub observed_coherence: f64,
    pub error: f64,
    pub lambda1_before: f64,
    pub lambda1_after: f64,
}

/// Run the controller when `update_count` hits the interval. Histories must
/// already include the current update.
pub fn maybe_adjust(state: &mut AgentState, cfg: &ControllerConfig) -> Option<ControllerStep> {
    if state.update_count == 0 || state.update_count % cfg.interval != 0 {
        return None;
    }
    let voids: Vec<bool> = StateHistory::tail(&state.history.void_active, cfg.window).collect();
    let cohs: Vec<f64> = StateHistory::tail(&state.history.coherence, cfg.window).collect();
    if voids.is_empty() || cohs.is_empty() {
        return None;
    }
    let observed_void_freq = voids.iter().filter(|v| **v).count() as f64 / voids.len() as f64;
    let observed_coherence = cohs.iter().sum::<f64>() / cohs.len() as f64;

    let error = (cfg.target_void_freq - observed_void_freq) + (observed_coherence - cfg.target_coherence);
    state.controller_integral =
        (state.controller_integral + error).clamp(-cfg.integral_limit, cfg.integral_limit);

    let before = state.lambda1;
    state.lambda1 = (before + cfg.kp * error + cfg.ki * state.controller_integral)
        .clamp(cfg.lambda1_min, cfg.lambda1_max);

    Some(ControllerStep {
        observed_void_freq,
        observed_coherence,
        error,
        lambda1_before: before,
        lambda1_after: state.lambda1,
    })
}
