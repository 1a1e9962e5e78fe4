//! One governance evaluation: drift, dynamics, void check, risk, verdict

use crate::controller::{maybe_adjust, sampling_params, ControllerStep, SamplingParams};
use crate::decision::{decide, Verdict};
use crate::drift::{drift_vector, norm_sq};
use crate::dynamics::step;
use crate::report::UpdateReport;
use crate::risk::{RiskBreakdown, RiskScorer};
use crate::void_state::{adaptive_threshold, is_void};
use eisv_core::{AgentState, GovernanceConfig};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub risk: RiskBreakdown,
    pub drift: [f64; 3],
    pub sampling: SamplingParams,
    pub controller: Option<ControllerStep>,
}

/// Advance `state` in place for one report. Callers hold the agent lock.
pub fn evaluate(
    state: &mut AgentState,
    report: &UpdateReport,
    config: &GovernanceConfig,
    scorer: &RiskScorer,
) -> Evaluation {
    let report = report.sanitized();
    let drift = drift_vector(&report, state, &config.dynamics);

    step(state, &config.dynamics, norm_sq(&drift));

    state.void_threshold = adaptive_threshold(&state.history.v, &config.void_state);
    state.void_active = is_void(state.v, state.void_threshold);

    let risk = scorer.score(&report, state.coherence);
    state.risk = risk.total;

    let verdict = decide(state.coherence, state.void_active, risk.total, &config.decision);

    state.record_history(config.storage.history_retention);
    state.update_count += 1;
    let controller = maybe_adjust(state, &config.controller);
    if let Some(c) = &controller {
        debug!(
            "controller: void_freq={:.3} coherence={:.3} lambda1 {:.3} -> {:.3}",
            c.observed_void_freq, c.observed_coherence, c.lambda1_before, c.lambda1_after
        );
    }

    Evaluation {
        verdict,
        risk,
        drift,
        sampling: sampling_params(state.lambda1),
        controller,
    }
}
