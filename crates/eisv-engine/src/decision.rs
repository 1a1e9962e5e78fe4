//! Decision policy, first match wins

use eisv_core::config::DecisionConfig;
use eisv_core::{Action, Decision, ReasonCode};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub action: Action,
    pub reason: ReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl Verdict {
    fn new(decision: Decision, reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            decision,
            action: decision.action(),
            reason,
            message: message.into(),
            guidance: None,
        }
    }

    /// Reply for an agent that is paused pending review.
    pub fn paused(reason: Option<&str>) -> Self {
        let mut v = Self::new(
            Decision::Reject,
            ReasonCode::Paused,
            "agent is paused pending review",
        );
        v.guidance = reason.map(|r| format!("paused: {r}"));
        v
    }
}

pub fn decide(coherence: f64, void_active: bool, risk: f64, cfg: &DecisionConfig) -> Verdict {
    if coherence < cfg.coherence_critical_threshold {
        return Verdict::new(
            Decision::Reject,
            ReasonCode::CoherenceCritical,
            "coherence critically low",
        );
    }
    if void_active {
        return Verdict::new(
            Decision::Reject,
            ReasonCode::VoidActive,
            "energy/integrity imbalance",
        );
    }
    if risk < cfg.approve_threshold {
        return Verdict::new(Decision::Approve, ReasonCode::Approved, "within safe bounds");
    }
    if risk < cfg.revise_threshold {
        let mut v = Verdict::new(Decision::Revise, ReasonCode::ReviseGuidance, "elevated risk");
        v.guidance = Some(
            "simplify the next step, shorten the output and re-check assumptions before continuing"
                .into(),
        );
        return v;
    }
    Verdict::new(Decision::Reject, ReasonCode::RiskTooHigh, "risk above revise threshold")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coherence_override_beats_low_risk() {
        let v = decide(0.39, false, 0.0, &DecisionConfig::default());
        assert_eq!(v.decision, Decision::Reject);
        assert_eq!(v.reason, ReasonCode::CoherenceCritical);
    }

    #[test]
    fn void_beats_low_risk() {
        let v = decide(0.6, true, 0.0, &DecisionConfig::default());
        assert_eq!(v.reason, ReasonCode::VoidActive);
    }

    #[test]
    fn risk_bands() {
        let cfg = DecisionConfig::default();
        assert_eq!(decide(0.5, false, 0.29, &cfg).decision, Decision::Approve);
        let revise = decide(0.5, false, 0.30, &cfg);
        assert_eq!(revise.decision, Decision::Revise);
        assert_eq!(revise.action, Action::Caution);
        assert!(revise.guidance.is_some());
        assert_eq!(decide(0.5, false, 0.50, &cfg).decision, Decision::Reject);
    }
}
