//! Drift vector Δη derived from a report

use crate::report::UpdateReport;
use eisv_core::config::DynamicsConfig;
use eisv_core::AgentState;

/// `[primary drift, coherence loss, complexity contribution]`
pub fn drift_vector(report: &UpdateReport, state: &AgentState, cfg: &DynamicsConfig) -> [f64; 3] {
    let mut primary = report
        .ethical_drift
        .as_ref()
        .map(|v| v.iter().map(|x| x * x).sum::<f64>().sqrt())
        .unwrap_or(0.0)
        .min(1.0);
    if let Some(confidence) = report.confidence {
        primary += (1.0 - confidence) * cfg.drift_confidence_gain;
    }

    let history = &state.history.coherence;
    let coherence_loss = match history.len() {
        n if n >= 2 => (history[n - 2] - history[n - 1]).max(0.0),
        _ => 0.0,
    };

    [
        primary.min(1.0),
        coherence_loss,
        report.complexity * cfg.drift_complexity_gain,
    ]
}

pub fn norm_sq(v: &[f64; 3]) -> f64 {
    v.iter().map(|x| x * x).sum()
}
