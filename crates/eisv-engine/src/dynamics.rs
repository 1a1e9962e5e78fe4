//! EISV state dynamics, one explicit Euler step per update
//!
//! ```text
//! dE/dt = α(I−E) − βe·E·S + γe·E·‖Δη‖²
//! dI/dt = −k·S + βi·I·C(V) − γi·I·(1−I)
//! dS/dt = −μ·S + λ1·‖Δη‖² − λ2·C(V)
//! dV/dt = κ(E−I) − δ·V
//! ```

use eisv_core::config::DynamicsConfig;
use eisv_core::{coherence, AgentState};

/// Advance `state` by `dt`. E and I are clamped to [0, 1], S to [0, 2];
/// coherence is recomputed from the new V.
pub fn step(state: &mut AgentState, cfg: &DynamicsConfig, drift_sq: f64) {
    let (e, i, s, v) = (state.e, state.i, state.s, state.v);
    let c = coherence(v, cfg.c_max);

    let de = cfg.alpha * (i - e) - cfg.beta_e * e * s + cfg.gamma_e * e * drift_sq;
    let di = -cfg.k * s + cfg.beta_i * i * c - cfg.gamma_i * i * (1.0 - i);
    let ds = -cfg.mu * s + state.lambda1 * drift_sq - cfg.lambda2 * c;
    let dv = cfg.kappa * (e - i) - cfg.delta * v;

    state.e = finite_or(e + de * cfg.dt, e).clamp(0.0, 1.0);
    state.i = finite_or(i + di * cfg.dt, i).clamp(0.0, 1.0);
    state.s = finite_or(s + ds * cfg.dt, s).clamp(0.0, 2.0);
    state.v = finite_or(v + dv * cfg.dt, v);
    state.coherence = coherence(state.v, cfg.c_max);
    state.time += cfg.dt;
}

fn finite_or(x: f64, fallback: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        fallback
    }
}
